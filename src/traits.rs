//! Compile-time configuration of merge containers.
//!
//! A traits value fixes how keys are ordered (by hash or by `Ord`), how
//! large each segment is, and which Bloom filter sorted segments carry.
//! `KeyOf` says which part of a stored item is the key.

use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::marker::PhantomData;

use hashbrown::hash_map::DefaultHashBuilder;

use crate::bloom::{Bloom, BloomFilter, NoBloom};

/// How sorted segments are ordered and searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderMode {
    /// Ordered by hash code; supports single-item removal.
    Hash,
    /// Ordered by `is_less`, which must not panic. Merges relocate items
    /// while comparing, under an abort-on-unwind guard.
    LessNothrow,
    /// Ordered by `is_less`, which may panic. Merges compute the final
    /// order before moving anything.
    LessThrow,
}

impl OrderMode {
    #[inline]
    pub const fn is_hash(self) -> bool {
        matches!(self, OrderMode::Hash)
    }
}

/// Ordering, hashing and sizing policy for a merge container over keys `K`.
pub trait MergeTraits<K>: Clone {
    const MODE: OrderMode;

    /// Segment 0 holds `2^LOG_INITIAL_ITEM_COUNT` items.
    const LOG_INITIAL_ITEM_COUNT: u32 = 3;

    type Bloom: BloomFilter;

    /// Hash of `key`. Only consulted in hash mode or when `Bloom` can hold
    /// bits.
    fn hash_code(&self, key: &K) -> u64;

    /// Strict weak ordering. Only consulted in the `Less*` modes.
    fn is_less(&self, a: &K, b: &K) -> bool;

    fn is_equal(&self, a: &K, b: &K) -> bool;

    /// Capacity of segment `index`: `2^L` for segment 0 and `2^L << (index - 1)`
    /// above it, so a full run of segments `0..k` fits exactly into segment `k`.
    #[inline]
    fn segment_item_count(index: usize) -> usize {
        let initial = 1usize << Self::LOG_INITIAL_ITEM_COUNT;
        if index == 0 {
            initial
        } else {
            initial << (index - 1)
        }
    }
}

/// Selects the key of a stored item.
pub trait KeyOf<I> {
    type Key;

    fn key(item: &I) -> &Self::Key;
}

/// The item is its own key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<T> KeyOf<T> for Identity {
    type Key = T;

    #[inline]
    fn key(item: &T) -> &T {
        item
    }
}

/// The key is the first field of a pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct First;

impl<K, V> KeyOf<(K, V)> for First {
    type Key = K;

    #[inline]
    fn key(item: &(K, V)) -> &K {
        &item.0
    }
}

/// Hash-ordered traits: `Hash + Eq` keys, hashes from `S`.
pub struct HashTraits<S = DefaultHashBuilder, B = NoBloom, const LOG_INIT: u32 = 3> {
    hasher: S,
    _bloom: PhantomData<fn() -> B>,
}

impl<S, B, const LOG_INIT: u32> HashTraits<S, B, LOG_INIT> {
    pub fn with_hasher(hasher: S) -> Self {
        Self { hasher, _bloom: PhantomData }
    }

    pub fn hasher(&self) -> &S {
        &self.hasher
    }
}

impl<S: Default, B, const LOG_INIT: u32> Default for HashTraits<S, B, LOG_INIT> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<S: Clone, B, const LOG_INIT: u32> Clone for HashTraits<S, B, LOG_INIT> {
    fn clone(&self) -> Self {
        Self::with_hasher(self.hasher.clone())
    }
}

impl<S, B, const LOG_INIT: u32> fmt::Debug for HashTraits<S, B, LOG_INIT> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashTraits").field("log_initial_item_count", &LOG_INIT).finish()
    }
}

impl<K, S, B, const LOG_INIT: u32> MergeTraits<K> for HashTraits<S, B, LOG_INIT>
where
    K: Hash + Eq,
    S: BuildHasher + Clone,
    B: BloomFilter,
{
    const MODE: OrderMode = OrderMode::Hash;
    const LOG_INITIAL_ITEM_COUNT: u32 = LOG_INIT;
    type Bloom = B;

    #[inline]
    fn hash_code(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    fn is_less(&self, a: &K, b: &K) -> bool {
        // Hash mode orders by hash code.
        self.hash_code(a) < self.hash_code(b)
    }

    #[inline]
    fn is_equal(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// Key-ordered traits over `Ord` keys. `NOTHROW` promises that comparisons
/// never panic. With a real Bloom filter keys must also be `Hash`.
pub struct LessTraits<
    B = NoBloom,
    S = DefaultHashBuilder,
    const LOG_INIT: u32 = 3,
    const NOTHROW: bool = false,
> {
    hasher: S,
    _bloom: PhantomData<fn() -> B>,
}

/// Key-ordered traits whose comparisons are promised not to panic.
pub type NothrowLessTraits<B = NoBloom, S = DefaultHashBuilder> = LessTraits<B, S, 3, true>;

impl<B, S, const LOG_INIT: u32, const NOTHROW: bool> LessTraits<B, S, LOG_INIT, NOTHROW> {
    pub fn with_hasher(hasher: S) -> Self {
        Self { hasher, _bloom: PhantomData }
    }

    const fn mode() -> OrderMode {
        if NOTHROW {
            OrderMode::LessNothrow
        } else {
            OrderMode::LessThrow
        }
    }
}

impl<B, S: Default, const LOG_INIT: u32, const NOTHROW: bool> Default
    for LessTraits<B, S, LOG_INIT, NOTHROW>
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<B, S: Clone, const LOG_INIT: u32, const NOTHROW: bool> Clone
    for LessTraits<B, S, LOG_INIT, NOTHROW>
{
    fn clone(&self) -> Self {
        Self::with_hasher(self.hasher.clone())
    }
}

impl<B, S, const LOG_INIT: u32, const NOTHROW: bool> fmt::Debug
    for LessTraits<B, S, LOG_INIT, NOTHROW>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LessTraits")
            .field("log_initial_item_count", &LOG_INIT)
            .field("nothrow", &NOTHROW)
            .finish()
    }
}

impl<K, S, const LOG_INIT: u32, const NOTHROW: bool> MergeTraits<K>
    for LessTraits<NoBloom, S, LOG_INIT, NOTHROW>
where
    K: Ord,
    S: Clone,
{
    const MODE: OrderMode = Self::mode();
    const LOG_INITIAL_ITEM_COUNT: u32 = LOG_INIT;
    type Bloom = NoBloom;

    #[inline]
    fn hash_code(&self, _key: &K) -> u64 {
        // Never consulted: no filter and no hash ordering.
        0
    }

    #[inline]
    fn is_less(&self, a: &K, b: &K) -> bool {
        a < b
    }

    #[inline]
    fn is_equal(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

impl<K, S, const LOG_INIT: u32, const NOTHROW: bool, const LOG_MULT: u32> MergeTraits<K>
    for LessTraits<Bloom<LOG_MULT>, S, LOG_INIT, NOTHROW>
where
    K: Ord + Hash,
    S: BuildHasher + Clone,
{
    const MODE: OrderMode = Self::mode();
    const LOG_INITIAL_ITEM_COUNT: u32 = LOG_INIT;
    type Bloom = Bloom<LOG_MULT>;

    #[inline]
    fn hash_code(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    #[inline]
    fn is_less(&self, a: &K, b: &K) -> bool {
        a < b
    }

    #[inline]
    fn is_equal(&self, a: &K, b: &K) -> bool {
        a == b
    }
}
