//! Block pools backing bucket clusters.
//!
//! A bucket cluster of size class `c` owns one block holding `c` items. Freed
//! blocks are kept in a small per-class cache and handed out again before
//! going back to the allocator, which keeps bucket promotion churn away from
//! the global allocator during steady insert/remove traffic.

use core::mem;
use core::ptr::NonNull;
use std::alloc::{self, Layout};

use crate::error::{Error, Result};

/// Blocks cached per size class before frees go straight to the allocator.
pub const CACHED_FREE_BLOCKS: usize = 16;

pub struct BucketPools<T, const MAX: usize> {
    free: [Vec<NonNull<T>>; MAX],
}

impl<T, const MAX: usize> BucketPools<T, MAX> {
    pub fn new() -> Self {
        Self {
            free: core::array::from_fn(|_| Vec::new()),
        }
    }

    /// Hand out a block for `class` items (`1..=MAX`).
    pub fn allocate(&mut self, class: usize) -> Result<NonNull<T>> {
        debug_assert!((1..=MAX).contains(&class));
        if let Some(block) = self.free[class - 1].pop() {
            return Ok(block);
        }
        if mem::size_of::<T>() == 0 {
            return Ok(NonNull::dangling());
        }
        let layout = Self::layout(class)?;
        let raw = unsafe { alloc::alloc(layout) } as *mut T;
        NonNull::new(raw).ok_or_else(|| Error::out_of_memory(layout.size()))
    }

    /// Return a block obtained from `allocate(class)`. Items in it must
    /// already be dropped or relocated.
    ///
    /// # Safety
    /// `block` must come from this pool with the same `class`.
    pub unsafe fn deallocate(&mut self, class: usize, block: NonNull<T>) {
        debug_assert!((1..=MAX).contains(&class));
        if mem::size_of::<T>() == 0 {
            return;
        }
        let cache = &mut self.free[class - 1];
        if cache.len() < CACHED_FREE_BLOCKS && cache.try_reserve(1).is_ok() {
            cache.push(block);
            return;
        }
        Self::release(class, block);
    }

    /// Number of cached free blocks for `class`.
    pub fn cached(&self, class: usize) -> usize {
        self.free[class - 1].len()
    }

    /// Give every cached block back to the allocator.
    pub fn trim(&mut self) {
        for (i, cache) in self.free.iter_mut().enumerate() {
            for block in cache.drain(..) {
                unsafe { Self::release(i + 1, block) };
            }
        }
    }

    fn layout(class: usize) -> Result<Layout> {
        Layout::array::<T>(class)
            .map_err(|_| Error::out_of_memory(class.saturating_mul(mem::size_of::<T>())))
    }

    unsafe fn release(class: usize, block: NonNull<T>) {
        if mem::size_of::<T>() == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(class) {
            alloc::dealloc(block.as_ptr() as *mut u8, layout);
        }
    }
}

impl<T, const MAX: usize> Default for BucketPools<T, MAX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const MAX: usize> Drop for BucketPools<T, MAX> {
    fn drop(&mut self) {
        self.trim();
    }
}
