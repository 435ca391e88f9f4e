//! Segment buffers of a merge container.
//!
//! A segment owns one raw buffer of `capacity` slots. Slots `[0, filled)`
//! were written; a slot in that prefix is live unless its tombstone bit is
//! set. Hash-ordered sorted segments keep a parallel array of hash codes for
//! every written slot so searches never rehash items, even tombstoned ones.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use crate::array;
use crate::bloom::BloomFilter;
use crate::error::Result;
use crate::object;

const WORD_BITS: usize = u64::BITS as usize;

pub(crate) struct Segment<T, B> {
    items: NonNull<T>,
    capacity: usize,
    filled: usize,
    live: usize,
    hashes: Vec<u64>,
    tombstones: Option<Box<[u64]>>,
    bloom: B,
    _marker: PhantomData<T>,
}

impl<T, B: BloomFilter> Segment<T, B> {
    /// Descriptor without a buffer.
    pub(crate) fn empty() -> Self {
        Self {
            items: NonNull::dangling(),
            capacity: 0,
            filled: 0,
            live: 0,
            hashes: Vec::new(),
            tombstones: None,
            bloom: B::default(),
            _marker: PhantomData,
        }
    }

    /// Allocate a buffer of `capacity` slots, plus room for one hash per slot
    /// when `with_hashes` is set.
    pub(crate) fn allocate(capacity: usize, with_hashes: bool) -> Result<Self> {
        let mut segment = Self::empty();
        segment.items = array::allocate::<T>(capacity)?;
        segment.capacity = capacity;
        if with_hashes {
            segment.hashes.try_reserve_exact(capacity)?;
        }
        Ok(segment)
    }

    /// Size the filter for this segment's capacity. A filter that cannot be
    /// allocated is simply left empty.
    pub(crate) fn init_bloom(&mut self) {
        if B::IS_ALWAYS_EMPTY || self.capacity == 0 {
            return;
        }
        let log = usize::BITS - 1 - self.capacity.leading_zeros();
        if let Err(err) = self.bloom.init(log) {
            log::debug!("segment bloom filter unavailable ({err}); continuing without it");
        }
    }

    #[inline]
    pub(crate) fn is_allocated(&self) -> bool {
        self.capacity > 0
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub(crate) fn filled(&self) -> usize {
        self.filled
    }

    #[inline]
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    #[inline]
    pub(crate) fn has_room(&self) -> bool {
        self.filled < self.capacity
    }

    #[inline]
    pub(crate) fn hashes(&self) -> &[u64] {
        &self.hashes
    }

    #[inline]
    pub(crate) fn bloom(&self) -> &B {
        &self.bloom
    }

    #[inline]
    pub(crate) fn is_live(&self, index: usize) -> bool {
        index < self.filled
            && match self.tombstones.as_deref() {
                Some(bits) => bits[index / WORD_BITS] & (1 << (index % WORD_BITS)) == 0,
                None => true,
            }
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        if self.is_live(index) {
            Some(unsafe { &*self.items.as_ptr().add(index) })
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if self.is_live(index) {
            Some(unsafe { &mut *self.items.as_ptr().add(index) })
        } else {
            None
        }
    }

    /// Raw pointer to slot `index`, for merges that relocate items.
    #[inline]
    pub(crate) fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index <= self.capacity);
        unsafe { self.items.as_ptr().add(index) }
    }

    /// Written slots as a slice. Only valid while no slot is tombstoned.
    #[inline]
    pub(crate) fn as_slice(&self) -> &[T] {
        debug_assert!(self.tombstones.is_none());
        unsafe { core::slice::from_raw_parts(self.items.as_ptr(), self.filled) }
    }

    /// Build the next item in place. On panic the segment is unchanged.
    pub(crate) fn push_with<F>(&mut self, creator: F) -> usize
    where
        F: FnOnce() -> T,
    {
        debug_assert!(self.has_room());
        let index = self.filled;
        unsafe { object::construct(self.slot_ptr(index), creator) };
        self.filled += 1;
        self.live += 1;
        index
    }

    /// Append an item relocated from elsewhere, with its hash when this
    /// segment keeps hashes.
    ///
    /// # Safety
    /// `src` must be a live item that the caller never touches again.
    #[inline]
    pub(crate) unsafe fn push_relocated(&mut self, src: *const T, hash: u64) {
        debug_assert!(self.has_room());
        object::relocate(src, self.slot_ptr(self.filled), 1);
        if self.hashes.capacity() > 0 {
            debug_assert!(self.hashes.len() < self.hashes.capacity());
            self.hashes.push(hash);
        }
        self.bloom.set(hash);
        self.filled += 1;
        self.live += 1;
    }

    /// Remove slot `index` by moving the last item into it. Segment 0 only.
    pub(crate) fn swap_remove(&mut self, index: usize) -> T {
        debug_assert!(self.tombstones.is_none() && index < self.filled);
        let last = self.filled - 1;
        self.filled = last;
        self.live -= 1;
        unsafe {
            let item = ptr::read(self.slot_ptr(index));
            if index != last {
                object::relocate(self.slot_ptr(last), self.slot_ptr(index), 1);
            }
            item
        }
    }

    /// Make sure a tombstone bitmap exists so `take` cannot fail.
    pub(crate) fn ensure_tombstones(&mut self) -> Result<()> {
        if self.tombstones.is_none() {
            let words = self.capacity.div_ceil(WORD_BITS);
            let mut bits = Vec::new();
            bits.try_reserve_exact(words)?;
            bits.resize(words, 0u64);
            self.tombstones = Some(bits.into_boxed_slice());
        }
        Ok(())
    }

    /// Move the live item at `index` out of a sorted segment. Taking the last
    /// live item empties the segment; otherwise the slot is tombstoned and
    /// `ensure_tombstones` must have succeeded first.
    pub(crate) fn take(&mut self, index: usize) -> T {
        debug_assert!(self.is_live(index));
        let item = unsafe { ptr::read(self.slot_ptr(index)) };
        self.live -= 1;
        if self.live == 0 {
            self.filled = 0;
            self.hashes.clear();
            self.tombstones = None;
        } else if let Some(bits) = self.tombstones.as_deref_mut() {
            bits[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        } else {
            debug_assert!(false, "tombstone bitmap missing");
        }
        item
    }

    /// Close the holes left by `take`, keeping live items in order.
    pub(crate) fn compact(&mut self) {
        let Some(bits) = self.tombstones.take() else {
            return;
        };
        let mut write = 0;
        for read in 0..self.filled {
            if bits[read / WORD_BITS] & (1 << (read % WORD_BITS)) != 0 {
                continue;
            }
            if read != write {
                unsafe { object::relocate(self.slot_ptr(read), self.slot_ptr(write), 1) };
                if let Some(&hash) = self.hashes.get(read) {
                    self.hashes[write] = hash;
                }
            }
            write += 1;
        }
        debug_assert_eq!(write, self.live);
        self.filled = write;
        self.hashes.truncate(write);
    }

    /// Pop the highest written live item, discarding trailing tombstones.
    pub(crate) fn pop(&mut self) -> Option<T> {
        while self.filled > 0 {
            let index = self.filled - 1;
            let live = self.is_live(index);
            self.filled = index;
            if live {
                self.live -= 1;
                return Some(unsafe { ptr::read(self.slot_ptr(index)) });
            }
        }
        None
    }

    /// Forget every item without dropping it; a merge has relocated them.
    pub(crate) fn forget_items(&mut self) {
        self.filled = 0;
        self.live = 0;
        self.hashes.clear();
        self.tombstones = None;
    }

    pub(crate) fn iter(&self) -> Slots<'_, T> {
        Slots {
            items: self.items.as_ptr(),
            tombstones: self.tombstones.as_deref(),
            index: 0,
            end: self.filled,
            _marker: PhantomData,
        }
    }

    pub(crate) fn iter_mut(&mut self) -> SlotsMut<'_, T> {
        SlotsMut {
            items: self.items.as_ptr(),
            tombstones: self.tombstones.as_deref(),
            index: 0,
            end: self.filled,
            _marker: PhantomData,
        }
    }

    /// Copy of the live items, compacted, with hashes and filter carried over.
    pub(crate) fn try_clone(&self) -> Result<Self>
    where
        T: Clone,
    {
        if !self.is_allocated() {
            return Ok(Self::empty());
        }
        let mut copy = Self::allocate(self.capacity, !self.hashes.is_empty())?;
        for index in 0..self.filled {
            if let Some(item) = self.get(index) {
                copy.push_with(|| item.clone());
                if let Some(&hash) = self.hashes.get(index) {
                    copy.hashes.push(hash);
                }
            }
        }
        copy.bloom = self.bloom.duplicate();
        Ok(copy)
    }
}

impl<T, B> Drop for Segment<T, B> {
    fn drop(&mut self) {
        unsafe {
            match self.tombstones.as_deref() {
                None => object::destroy(self.items.as_ptr(), self.filled),
                Some(bits) => {
                    for index in 0..self.filled {
                        if bits[index / WORD_BITS] & (1 << (index % WORD_BITS)) == 0 {
                            object::destroy(self.items.as_ptr().add(index), 1);
                        }
                    }
                }
            }
            array::deallocate(self.items, self.capacity);
        }
    }
}

fn is_tombstoned(bits: Option<&[u64]>, index: usize) -> bool {
    bits.is_some_and(|bits| bits[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0)
}

/// Live items of one segment.
pub(crate) struct Slots<'a, T> {
    items: *const T,
    tombstones: Option<&'a [u64]>,
    index: usize,
    end: usize,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Slots<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        while self.index < self.end {
            let index = self.index;
            self.index += 1;
            if !is_tombstoned(self.tombstones, index) {
                return Some(unsafe { &*self.items.add(index) });
            }
        }
        None
    }
}

/// Live items of one segment, mutably.
pub(crate) struct SlotsMut<'a, T> {
    items: *mut T,
    tombstones: Option<&'a [u64]>,
    index: usize,
    end: usize,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> Iterator for SlotsMut<'a, T> {
    type Item = &'a mut T;

    fn next(&mut self) -> Option<&'a mut T> {
        while self.index < self.end {
            let index = self.index;
            self.index += 1;
            if !is_tombstoned(self.tombstones, index) {
                return Some(unsafe { &mut *self.items.add(index) });
            }
        }
        None
    }
}
