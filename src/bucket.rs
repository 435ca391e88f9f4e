//! Bucket clusters: up to `MAX` items stored in place per hash-table bucket.
//!
//! A cluster owns one pool block whose size class (`1..=MAX` items) grows by
//! one each time the block fills. Next to the block it keeps two bytes per
//! slot:
//!
//! - a *short code*, the top 7 bits of the item's hash, or a value with the
//!   high bit set for an unused slot. Lookups compare short codes before
//!   calling the equality predicate.
//! - a *code-probe* byte recording the probe distance at insert time plus a
//!   few hash bits above the bucket index. Regrowth uses it to rebuild the
//!   part of the hash that decides the new bucket without rehashing the key.
//!
//! Once a cluster reaches size class `MAX` it stays there even after its last
//! item is removed ("was full"). Probe sequences stop at the first bucket that
//! was never full, so this stickiness keeps every displaced item reachable.

use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::slice;

use scopeguard::ScopeGuard;

use crate::error::{Error, Result};
use crate::object;
use crate::pool::BucketPools;

const MASK_EMPTY: u8 = 128;
const EMPTY_CODE_PROBE: u8 = 255;
const LOG_BUCKET_COUNT_STEP: u32 = 8;
const LOG_BUCKET_COUNT_ADDEND: u32 = 6;
const SHORT_CODE_SHIFT: u32 = 64 - 7;

/// Top 7 bits of a hash, as stored per occupied slot.
#[inline]
pub fn short_code(hash: u64) -> u8 {
    (hash >> SHORT_CODE_SHIFT) as u8
}

#[inline]
fn probe_shift(log_bucket_count: u32) -> u32 {
    (log_bucket_count + LOG_BUCKET_COUNT_ADDEND) % LOG_BUCKET_COUNT_STEP
}

/// In-place cluster of at most `MAX` items.
///
/// A cluster does not own its pools: it must be emptied with [`Bucket::clear`]
/// or [`Bucket::forget`] against the pools it was filled from before it is
/// dropped, otherwise its block leaks.
pub struct Bucket<T, const MAX: usize> {
    items: Option<NonNull<T>>,
    class: u8,
    short_codes: [u8; MAX],
    code_probes: [u8; MAX],
    _marker: PhantomData<T>,
}

impl<T, const MAX: usize> Bucket<T, MAX> {
    const MAX_OK: () = assert!(0 < MAX && MAX <= 4, "bucket max count must be 1..=4");

    pub fn new() -> Self {
        let () = Self::MAX_OK;
        Self {
            items: None,
            class: 1,
            short_codes: [EMPTY_CODE_PROBE; MAX],
            code_probes: [EMPTY_CODE_PROBE; MAX],
            _marker: PhantomData,
        }
    }

    /// Number of occupied slots: the leading run of valid short codes.
    #[inline]
    pub fn len(&self) -> usize {
        self.short_codes
            .iter()
            .take_while(|&&c| c < MASK_EMPTY)
            .count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_none()
    }

    /// Size class of the current (or next) block.
    #[inline]
    pub fn size_class(&self) -> usize {
        self.class as usize
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.short_codes[MAX - 1] < MASK_EMPTY
    }

    /// True once the cluster has reached its largest size class.
    #[inline]
    pub fn was_full(&self) -> bool {
        self.size_class() == MAX
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        match self.items {
            Some(p) => unsafe { slice::from_raw_parts(p.as_ptr(), self.len()) },
            None => &[],
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self.items {
            Some(p) => unsafe { slice::from_raw_parts_mut(p.as_ptr(), self.len()) },
            None => &mut [],
        }
    }

    /// Slot of the first item whose short code matches `hash` and which
    /// satisfies `pred`.
    #[inline]
    pub fn find<P>(&self, mut pred: P, hash: u64) -> Option<usize>
    where
        P: FnMut(&T) -> bool,
    {
        let code = short_code(hash);
        let items = self.as_slice();
        (0..items.len()).find(|&i| self.short_codes[i] == code && pred(&items[i]))
    }

    /// Build a new item with `creator` in the next free slot, promoting the
    /// block to the next size class when it is full. `probe` is the distance
    /// of this bucket from the item's home bucket.
    ///
    /// Promotion is all-or-nothing: the creator runs before any existing
    /// item moves, and a failed allocation or a panicking creator leaves the
    /// cluster unchanged.
    pub fn add<F>(
        &mut self,
        pools: &mut BucketPools<T, MAX>,
        creator: F,
        hash: u64,
        log_bucket_count: u32,
        probe: usize,
    ) -> Result<usize>
    where
        F: FnOnce() -> T,
    {
        let count = self.len();
        if count == MAX {
            return Err(Error::BucketFull);
        }
        let class = self.size_class();
        match self.items {
            None => {
                let block = pools.allocate(class)?;
                let guard = scopeguard::guard(&mut *pools, |pools| unsafe {
                    pools.deallocate(class, block)
                });
                unsafe { object::construct(block.as_ptr(), creator) };
                ScopeGuard::into_inner(guard);
                self.items = Some(block);
            }
            Some(items) if count < class => unsafe {
                object::construct(items.as_ptr().add(count), creator);
            },
            Some(items) => {
                let new_class = class + 1;
                let block = pools.allocate(new_class)?;
                let guard = scopeguard::guard(&mut *pools, |pools| unsafe {
                    pools.deallocate(new_class, block)
                });
                unsafe {
                    object::relocate_create(
                        items.as_ptr(),
                        block.as_ptr(),
                        count,
                        creator,
                        block.as_ptr().add(count),
                    );
                }
                let pools = ScopeGuard::into_inner(guard);
                unsafe { pools.deallocate(class, items) };
                self.items = Some(block);
                self.class = new_class as u8;
                log::trace!("bucket promoted to size class {new_class}");
            }
        }
        self.short_codes[count] = short_code(hash);
        self.set_code_probe(count, hash, log_bucket_count, probe);
        Ok(count)
    }

    /// Swap-remove the item in `slot`: the last item takes its place.
    /// Removing the last item frees the block; the size class then falls
    /// back to 1 unless the cluster was full.
    pub fn remove(&mut self, pools: &mut BucketPools<T, MAX>, slot: usize) -> Result<T> {
        let count = self.len();
        contract!(slot < count, Error::out_of_bounds(slot, count));
        let items = match self.items {
            Some(items) if slot < count => items,
            _ => return Err(Error::out_of_bounds(slot, count)),
        };
        let last = count - 1;
        let removed = unsafe { ptr::read(items.as_ptr().add(slot)) };
        if last == 0 {
            unsafe { pools.deallocate(self.size_class(), items) };
            let class = if self.was_full() { MAX } else { 1 };
            self.set_empty(class);
        } else {
            if slot != last {
                unsafe { object::relocate(items.as_ptr().add(last), items.as_ptr().add(slot), 1) };
                self.short_codes[slot] = self.short_codes[last];
                self.code_probes[slot] = self.code_probes[last];
            }
            self.short_codes[last] = EMPTY_CODE_PROBE;
            self.code_probes[last] = EMPTY_CODE_PROBE;
        }
        Ok(removed)
    }

    /// Rebuild the low `new_log_bucket_count` bits and the short code of the
    /// hash of the item in `slot`, which lives in bucket `bucket_index` of a
    /// table with `2^log_bucket_count` buckets. Falls back to `full` when the
    /// stored code-probe byte cannot cover the new table size.
    pub fn hash_code_part<F>(
        &self,
        full: F,
        slot: usize,
        bucket_index: usize,
        log_bucket_count: u32,
        new_log_bucket_count: u32,
    ) -> u64
    where
        F: FnOnce() -> u64,
    {
        let code_probe = self.code_probes[slot];
        let expired = code_probe.wrapping_add(1) <= MASK_EMPTY
            || (log_bucket_count + LOG_BUCKET_COUNT_ADDEND) / LOG_BUCKET_COUNT_STEP
                != (new_log_bucket_count + LOG_BUCKET_COUNT_ADDEND) / LOG_BUCKET_COUNT_STEP;
        if expired {
            return full();
        }
        let shift = probe_shift(log_bucket_count);
        let code_probe = u64::from(code_probe);
        let probe = code_probe & ((1u64 << shift) - 1);
        let bucket_count = 1u64 << log_bucket_count;
        ((bucket_index as u64 + bucket_count - probe) & (bucket_count - 1))
            | (((code_probe - u64::from(MASK_EMPTY)) >> shift) << log_bucket_count)
            | (u64::from(self.short_codes[slot]) << SHORT_CODE_SHIFT)
    }

    /// Drop every item and release the block.
    pub fn clear(&mut self, pools: &mut BucketPools<T, MAX>) {
        if let Some(items) = self.items {
            let count = self.len();
            self.items = None;
            unsafe {
                object::destroy(items.as_ptr(), count);
                pools.deallocate(self.size_class(), items);
            }
        }
        self.set_empty(1);
    }

    /// Release the block without dropping the items; the caller has
    /// relocated them elsewhere.
    pub(crate) fn forget(&mut self, pools: &mut BucketPools<T, MAX>) {
        if let Some(items) = self.items.take() {
            unsafe { pools.deallocate(self.size_class(), items) };
        }
        self.set_empty(1);
    }

    fn set_empty(&mut self, class: usize) {
        self.items = None;
        self.class = class as u8;
        self.short_codes = [EMPTY_CODE_PROBE; MAX];
        self.code_probes = [EMPTY_CODE_PROBE; MAX];
    }

    fn set_code_probe(&mut self, slot: usize, hash: u64, log_bucket_count: u32, probe: usize) {
        let shift = probe_shift(log_bucket_count);
        self.code_probes[slot] = if (probe as u64) < (1u64 << shift) {
            MASK_EMPTY | ((hash >> log_bucket_count) << shift) as u8 | probe as u8
        } else {
            EMPTY_CODE_PROBE
        };
    }
}

impl<T, const MAX: usize> Default for Bucket<T, MAX> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const MAX: usize> Drop for Bucket<T, MAX> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.items.is_none(), "bucket dropped while holding items");
        }
    }
}
