//! BucketHashSet: open-addressing hash set over in-place bucket clusters.
//!
//! Buckets are probed linearly from the key's home bucket. A probe sequence
//! ends at the first bucket that never reached its largest size class, since
//! an insert only moves past a bucket that is full. The table grows once it
//! holds `capacity()` keys; regrowth recovers the bits it needs from each
//! cluster's code-probe bytes and only rehashes a key when they run out.

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::mem;
use core::ptr;

use hashbrown::hash_map::DefaultHashBuilder;
use scopeguard::ScopeGuard;

use crate::bucket::Bucket;
use crate::check::DebugReentrancy;
use crate::error::{Error, Result};
use crate::pool::BucketPools;

const LOG_START_BUCKET_COUNT: u32 = 4;
const LOG_FAST_GROWTH_LIMIT: u32 = 20;

pub struct BucketHashSet<K, S = DefaultHashBuilder, const MAX: usize = 4> {
    table: Table<K, MAX>,
    len: usize,
    hasher: S,
    reentrancy: DebugReentrancy,
}

/// Bucket array plus the pools its clusters allocate from.
struct Table<K, const MAX: usize> {
    buckets: Vec<Bucket<K, MAX>>,
    log_bucket_count: u32,
    max_probe: usize,
    pools: BucketPools<K, MAX>,
}

impl<K, const MAX: usize> BucketHashSet<K, DefaultHashBuilder, MAX>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K, S, const MAX: usize> BucketHashSet<K, S, MAX>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            table: Table::new(),
            len: 0,
            hasher,
            reentrancy: DebugReentrancy::new(),
        }
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
    pub fn bucket_count(&self) -> usize {
        self.table.buckets.len()
    }

    /// Keys the table accepts before it grows.
    pub fn capacity(&self) -> usize {
        capacity_for::<MAX>(self.table.buckets.len())
    }

    /// Longest probe distance any insert has used.
    #[inline]
    pub fn max_probe(&self) -> usize {
        self.table.max_probe
    }

    #[inline]
    fn make_hash<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        self.hasher.hash_one(q)
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        self.get(key).is_some()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&K>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(key);
        let (b, slot) = self.table.locate(key, hash)?;
        Some(&self.table.buckets[b].as_slice()[slot])
    }

    /// Insert `key`; `Ok(false)` if an equal key is already present.
    pub fn insert(&mut self, key: K) -> Result<bool> {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(&key);
        if self.table.locate(&key, hash).is_some() {
            return Ok(false);
        }
        if self.len >= self.capacity() {
            let bucket_count = self.table.buckets.len();
            let new_log = if bucket_count == 0 {
                LOG_START_BUCKET_COUNT
            } else if bucket_count < 1 << LOG_FAST_GROWTH_LIMIT {
                self.table.log_bucket_count + 2
            } else {
                self.table.log_bucket_count + 1
            };
            self.table.regrow(&self.hasher, new_log)?;
            log::trace!(
                "bucket set regrown to {} buckets ({} keys)",
                self.table.buckets.len(),
                self.len
            );
        }
        self.table.place(hash, || key)?;
        self.len += 1;
        Ok(true)
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<K>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq + Hash,
    {
        let _g = self.reentrancy.enter();
        let hash = self.make_hash(key);
        let (b, slot) = self.table.locate(key, hash)?;
        let Table { buckets, pools, .. } = &mut self.table;
        let removed = buckets[b].remove(pools, slot).ok()?;
        self.len -= 1;
        Some(removed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &K> + '_ {
        self.table.buckets.iter().flat_map(|b| b.as_slice().iter())
    }

    pub fn clear(&mut self) {
        let _g = self.reentrancy.enter();
        self.table.clear();
        self.len = 0;
    }
}

fn capacity_for<const MAX: usize>(bucket_count: usize) -> usize {
    match MAX {
        1 => bucket_count / 8 * 5,
        2 => bucket_count / 2 * 3,
        _ => bucket_count * 2,
    }
}

impl<K, const MAX: usize> Table<K, MAX> {
    fn new() -> Self {
        Self {
            buckets: Vec::new(),
            log_bucket_count: 0,
            max_probe: 0,
            pools: BucketPools::new(),
        }
    }

    fn locate<Q>(&self, key: &Q, hash: u64) -> Option<(usize, usize)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        if self.buckets.is_empty() {
            return None;
        }
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        for _ in 0..=self.max_probe {
            let bucket = &self.buckets[index];
            if let Some(slot) = bucket.find(|k| k.borrow() == key, hash) {
                return Some((index, slot));
            }
            if !bucket.was_full() {
                return None;
            }
            index = (index + 1) & mask;
        }
        None
    }

    /// Build a key with `creator` in the first non-full bucket on the probe
    /// sequence of `hash`.
    fn place<F>(&mut self, hash: u64, creator: F) -> Result<()>
    where
        F: FnOnce() -> K,
    {
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        for probe in 0..self.buckets.len() {
            let bucket = &mut self.buckets[index];
            if !bucket.is_full() {
                bucket.add(&mut self.pools, creator, hash, self.log_bucket_count, probe)?;
                self.max_probe = self.max_probe.max(probe);
                return Ok(());
            }
            index = (index + 1) & mask;
        }
        Err(Error::BucketFull)
    }

    /// Move every key into a table of `2^new_log` buckets. Keys are copied
    /// into the new table first and the old clusters are released only once
    /// all of them have landed, so a failure leaves the old table in place.
    fn regrow<S: BuildHasher>(&mut self, hasher: &S, new_log: u32) -> Result<()>
    where
        K: Hash,
    {
        let new_count = 1usize << new_log;
        let mut buckets: Vec<Bucket<K, MAX>> = Vec::new();
        buckets.try_reserve_exact(new_count)?;
        buckets.resize_with(new_count, Bucket::new);
        let fresh = Table {
            buckets,
            log_bucket_count: new_log,
            max_probe: 0,
            pools: BucketPools::new(),
        };
        // Until committed, the fresh table holds bitwise copies only.
        let mut staged = scopeguard::guard(fresh, |mut fresh| fresh.forget());

        let old_log = self.log_bucket_count;
        for (index, bucket) in self.buckets.iter().enumerate() {
            for (slot, key) in bucket.as_slice().iter().enumerate() {
                let hash =
                    bucket.hash_code_part(|| hasher.hash_one(key), slot, index, old_log, new_log);
                let src: *const K = key;
                staged.place(hash, || unsafe { ptr::read(src) })?;
            }
        }
        let fresh = ScopeGuard::into_inner(staged);
        self.forget();
        let old = mem::replace(self, fresh);
        // `old` now holds only empty clusters and cached blocks.
        drop(old);
        Ok(())
    }

    /// Release every cluster without dropping its keys.
    fn forget(&mut self) {
        let Self { buckets, pools, .. } = self;
        for bucket in buckets.iter_mut() {
            bucket.forget(pools);
        }
    }

    fn clear(&mut self) {
        let Self { buckets, pools, .. } = self;
        for bucket in buckets.iter_mut() {
            bucket.clear(pools);
        }
        self.max_probe = 0;
    }
}

impl<K, const MAX: usize> Drop for Table<K, MAX> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<K, S, const MAX: usize> Default for BucketHashSet<K, S, MAX>
where
    K: Eq + Hash,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K: fmt::Debug, S, const MAX: usize> fmt::Debug for BucketHashSet<K, S, MAX> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.table.buckets.iter().flat_map(|b| b.as_slice().iter()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::hash::Hasher;
    use rand::seq::SliceRandom;
    use rand::{rngs::StdRng, SeedableRng};

    /// Hasher that returns the written u64 verbatim, so tests control
    /// home buckets and short codes.
    #[derive(Default, Clone)]
    struct IdentityHasher(u64);

    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = (self.0 << 8) | u64::from(b);
            }
        }
        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }

    #[derive(Default, Clone)]
    struct IdentityBuild;

    impl BuildHasher for IdentityBuild {
        type Hasher = IdentityHasher;
        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher::default()
        }
    }

    #[test]
    fn insert_contains_remove() {
        let mut set: BucketHashSet<u64> = BucketHashSet::new();
        assert!(set.insert(1).unwrap());
        assert!(!set.insert(1).unwrap());
        assert!(set.contains(&1));
        assert_eq!(set.remove(&1), Some(1));
        assert!(!set.contains(&1));
        assert!(set.is_empty());
    }

    /// Five keys sharing one home bucket: the first four fill that cluster
    /// (one promotion per add past the first), the fifth spills into the
    /// next bucket, and every key stays findable.
    #[test]
    fn colliding_keys_overflow_into_next_bucket() {
        let mut set: BucketHashSet<u64, IdentityBuild, 4> =
            BucketHashSet::with_hasher(IdentityBuild);
        // same low bits, distinct short codes
        let keys: Vec<u64> = (1..=5u64).map(|i| (i << 57) | 3).collect();
        for &k in &keys {
            assert!(set.insert(k).unwrap());
        }
        assert_eq!(set.table.buckets[3].len(), 4);
        assert_eq!(set.table.buckets[3].size_class(), 4);
        assert_eq!(set.table.buckets[4].len(), 1);
        assert_eq!(set.max_probe(), 1);
        for &k in &keys {
            assert!(set.contains(&k));
        }
        // removing from the full cluster keeps the spilled key reachable
        assert_eq!(set.remove(&keys[0]), Some(keys[0]));
        assert!(set.contains(&keys[4]));
    }

    #[test]
    fn grows_and_keeps_every_key() {
        let mut set: BucketHashSet<u64> = BucketHashSet::new();
        let mut keys: Vec<u64> = (0..5000).collect();
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        for &k in &keys {
            assert!(set.insert(k).unwrap());
            assert!(set.len() <= set.capacity());
        }
        assert_eq!(set.len(), 5000);
        assert!(set.bucket_count() >= 2048);
        for k in 0..5000u64 {
            assert!(set.contains(&k), "missing {k}");
        }
        assert!(!set.contains(&5000));
        let mut seen: Vec<u64> = set.iter().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..5000).collect::<Vec<_>>());
    }

    /// Regrowth through cached hash parts lands each key exactly where a
    /// fresh insert would look for it, including the identity-hash case
    /// where the code-probe bytes are used for every key.
    #[test]
    fn regrowth_with_identity_hash() {
        let mut set: BucketHashSet<u64, IdentityBuild, 4> =
            BucketHashSet::with_hasher(IdentityBuild);
        let keys: Vec<u64> = (0..3000u64)
            .map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15))
            .collect();
        for &k in &keys {
            set.insert(k).unwrap();
        }
        for &k in &keys {
            assert!(set.contains(&k));
        }
    }

    #[test]
    fn string_keys_with_borrowed_lookup() {
        let mut set: BucketHashSet<String, DefaultHashBuilder, 2> = BucketHashSet::default();
        for i in 0..200 {
            set.insert(format!("key-{i}")).unwrap();
        }
        assert!(set.contains("key-17"));
        assert_eq!(set.get("key-199").map(String::as_str), Some("key-199"));
        assert_eq!(set.remove("key-17").as_deref(), Some("key-17"));
        assert!(!set.contains("key-17"));
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.iter().count(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn reentrant_hash_panics_in_debug() {
        use std::cell::Cell;

        thread_local! {
            static SET: Cell<*const BucketHashSet<Reenter, DefaultHashBuilder, 4>> =
                const { Cell::new(core::ptr::null()) };
        }

        #[derive(PartialEq, Eq)]
        struct Reenter(u32);

        impl Hash for Reenter {
            fn hash<H: Hasher>(&self, state: &mut H) {
                let p = SET.with(|s| s.get());
                if !p.is_null() {
                    // Re-enter the set while it is probing.
                    unsafe { (*p).contains(&Reenter(0)) };
                }
                self.0.hash(state);
            }
        }

        let mut set: BucketHashSet<Reenter, DefaultHashBuilder, 4> = BucketHashSet::new();
        set.insert(Reenter(1)).unwrap();
        SET.with(|s| s.set(&set as *const _));
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            set.contains(&Reenter(1));
        }));
        SET.with(|s| s.set(core::ptr::null()));
        assert!(res.is_err());
    }
}
