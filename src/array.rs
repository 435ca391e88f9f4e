//! Growable contiguous array with shorter-side shifting.
//!
//! Items live in `[head, head + len)` of a raw buffer. `insert` and `remove`
//! move whichever side of the index is shorter, using the free slack in
//! front of `head` or behind the tail. Growth doubles the capacity and
//! relocates every item in one pass; the old buffer is released only after
//! the new one is populated, and relocation itself cannot fail, so a failed
//! allocation leaves the array untouched.

use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use core::slice;
use std::alloc::{self, Layout};

use crate::error::{Error, Result};
use crate::object;

const MIN_CAPACITY: usize = 4;

pub struct Array<T> {
    ptr: NonNull<T>,
    head: usize,
    len: usize,
    cap: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Array<T> {}
unsafe impl<T: Sync> Sync for Array<T> {}

impl<T> Array<T> {
    #[inline]
    pub const fn new() -> Self {
        Self {
            ptr: NonNull::dangling(),
            head: 0,
            len: 0,
            cap: if mem::size_of::<T>() == 0 { usize::MAX } else { 0 },
            _marker: PhantomData,
        }
    }

    pub fn with_capacity(cap: usize) -> Result<Self> {
        let mut array = Self::new();
        array.reserve(cap)?;
        Ok(array)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.first_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.first_ptr(), self.len) }
    }

    /// Checked random access.
    pub fn get(&self, index: usize) -> Result<&T> {
        contract!(index < self.len, Error::out_of_bounds(index, self.len));
        Ok(&self.as_slice()[index])
    }

    /// Checked random access.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        contract!(index < self.len, Error::out_of_bounds(index, self.len));
        Ok(&mut self.as_mut_slice()[index])
    }

    /// Ensure room for `capacity` items in total.
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.cap {
            return Ok(());
        }
        let new_cap = capacity.max(self.cap.saturating_mul(2)).max(MIN_CAPACITY);
        let new_ptr = allocate::<T>(new_cap)?;
        unsafe {
            object::relocate(self.first_ptr(), new_ptr.as_ptr(), self.len);
            deallocate(self.ptr, self.cap);
        }
        self.ptr = new_ptr;
        self.head = 0;
        self.cap = new_cap;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        self.make_room_at_tail()?;
        unsafe { ptr::write(self.first_ptr().add(self.len), value) };
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(unsafe { ptr::read(self.first_ptr().add(self.len)) })
    }

    #[inline]
    pub fn insert(&mut self, index: usize, value: T) -> Result<&mut T> {
        self.insert_with(index, || value)
    }

    /// Insert the item built by `creator` at `index`. The creator runs after
    /// capacity is secured and before any item is shifted, so a panic in it
    /// leaves the array unchanged.
    pub fn insert_with<F>(&mut self, index: usize, creator: F) -> Result<&mut T>
    where
        F: FnOnce() -> T,
    {
        contract!(index <= self.len, Error::out_of_bounds(index, self.len));
        let index = index.min(self.len);
        if self.len == self.cap {
            self.reserve(self.len + 1)?;
        }
        let value = creator();
        let front_room = self.head > 0;
        let back_room = self.head + self.len < self.cap;
        unsafe {
            if front_room && (index < self.len - index || !back_room) {
                let first = self.first_ptr();
                ptr::copy(first, first.sub(1), index);
                self.head -= 1;
            } else {
                let at = self.first_ptr().add(index);
                ptr::copy(at, at.add(1), self.len - index);
            }
            let slot = self.first_ptr().add(index);
            ptr::write(slot, value);
            self.len += 1;
            Ok(&mut *slot)
        }
    }

    /// Drop `count` items starting at `index` and close the gap from the
    /// shorter side.
    pub fn remove(&mut self, index: usize, count: usize) -> Result<()> {
        let in_range = index <= self.len && count <= self.len - index.min(self.len);
        contract!(in_range, Error::out_of_bounds(index.saturating_add(count), self.len));
        if !in_range {
            return Ok(());
        }
        let tail = self.len - index - count;
        unsafe {
            let first = self.first_ptr();
            // Shrink first so a panicking destructor leaks instead of double-dropping.
            let old_len = self.len;
            self.len = index;
            object::destroy(first.add(index), count);
            if index < tail {
                ptr::copy(first, first.add(count), index);
                self.head += count;
            } else {
                ptr::copy(first.add(index + count), first.add(index), tail);
            }
            self.len = old_len - count;
        }
        if self.len == 0 {
            self.head = 0;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        let len = mem::replace(&mut self.len, 0);
        unsafe { object::destroy(self.first_ptr(), len) };
        self.head = 0;
    }

    /// Release every item without dropping it. The caller takes over the
    /// items it read through raw pointers beforehand.
    pub(crate) fn forget_items(&mut self) {
        self.len = 0;
        self.head = 0;
    }

    #[inline]
    fn first_ptr(&self) -> *mut T {
        unsafe { self.ptr.as_ptr().add(self.head) }
    }

    fn make_room_at_tail(&mut self) -> Result<()> {
        if self.head + self.len < self.cap {
            return Ok(());
        }
        if self.head > 0 && self.len < self.cap / 2 {
            unsafe { ptr::copy(self.first_ptr(), self.ptr.as_ptr(), self.len) };
            self.head = 0;
            return Ok(());
        }
        // Growing past the current capacity relocates to `head == 0`.
        self.reserve(self.head + self.len + 1)
    }

    pub fn try_clone(&self) -> Result<Self>
    where
        T: Clone,
    {
        let mut copy = Self::with_capacity(self.len)?;
        for item in self.iter() {
            copy.push(item.clone())?;
        }
        Ok(copy)
    }
}

pub(crate) fn allocate<T>(cap: usize) -> Result<NonNull<T>> {
    if mem::size_of::<T>() == 0 || cap == 0 {
        return Ok(NonNull::dangling());
    }
    let layout = Layout::array::<T>(cap)
        .map_err(|_| Error::out_of_memory(cap.saturating_mul(mem::size_of::<T>())))?;
    let raw = unsafe { alloc::alloc(layout) } as *mut T;
    NonNull::new(raw).ok_or_else(|| Error::out_of_memory(layout.size()))
}

pub(crate) unsafe fn deallocate<T>(ptr: NonNull<T>, cap: usize) {
    if mem::size_of::<T>() == 0 || cap == 0 {
        return;
    }
    if let Ok(layout) = Layout::array::<T>(cap) {
        alloc::dealloc(ptr.as_ptr() as *mut u8, layout);
    }
}

impl<T> Drop for Array<T> {
    fn drop(&mut self) {
        unsafe {
            object::destroy(self.first_ptr(), self.len);
            deallocate(self.ptr, self.cap);
        }
    }
}

impl<T> Default for Array<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for Array<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for Array<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T: Clone> Clone for Array<T> {
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(copy) => copy,
            Err(err) => panic!("Array::clone: {err}"),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Array<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a Array<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
