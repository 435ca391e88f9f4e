//! mergeset: segmented hash and ordered sets/maps that grow by merging,
//! plus the storage and sorting layers they are built from.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: keep inserts cheap without ever rehashing the whole container,
//!   and keep lookups at O(log n) segments times a fast in-segment search.
//! - Layers:
//!   - `object`: lifecycle primitives (construct in place, destroy,
//!     relocate, relocate-and-construct). Every move is a bitwise copy, so
//!     the only fallible step is a user constructor.
//!   - `Array<T>`: growable buffer that shifts the shorter side on insert
//!     and remove.
//!   - `Bucket<T, MAX>` and `BucketHashSet`: small in-place item groups
//!     with per-slot short hash codes and size-class pools; the hash set
//!     probes linearly across buckets that were ever full.
//!   - `hash_sorter`: MSB-first radix sort by hash with equal-key grouping,
//!     and interpolation search over a hash-sorted slice.
//!   - `MergeSet<T, Tr, KO>` / `MergeMap<K, V, Tr>`: the segment stack.
//!     Segment 0 is unsorted; when it fills, segments `0..=k` merge into a
//!     sorted segment `k`, ordered by hash or by key.
//!
//! Constraints
//! - Single-threaded: no atomics, no locks. Containers are `!Sync`
//!   because of the debug reentrancy tracker.
//! - User code (hash, equality, ordering, constructors) reports failure by
//!   panicking. Inserts are all-or-nothing: buffers are allocated first,
//!   then user code runs, then items move. Bulk operations (`insert_many`,
//!   `remove_if`, `merge_from`) keep the work done before a failure.
//! - Allocation failure is an `Error::OutOfMemory`, never an abort.
//!
//! Reentrancy policy
//! - Structural entry points of `MergeSet` and `BucketHashSet` take a
//!   debug-only reentrancy guard. A callback that re-enters the same
//!   container panics in debug builds.
//!
//! Contract checks
//! - With the default `checked` feature, out-of-bounds indices, stale
//!   positions, adding at an occupied position and unsupported operations
//!   return `Err`. Without it they are debug assertions; release builds
//!   stay memory safe but may return an unspecified item or panic.
//!
//! Positions
//! - `find` returns a `Position` stamped with the container's version.
//!   Any structural mutation bumps the version, and resolving an older
//!   position fails with `Error::InvalidatedPosition`. Iterators borrow
//!   the container instead.
//!
//! Logging
//! - Uses the `log` facade: `trace!` for segment merges, bucket
//!   promotions and bucket-set regrowth, `debug!` when an optional Bloom
//!   filter cannot be allocated. No logger is installed here.

#[macro_use]
mod check;

pub mod array;
pub mod bloom;
pub mod bucket;
pub mod bucket_set;
pub mod error;
pub mod hash_sorter;
pub mod merge_map;
pub mod merge_set;
mod merge_set_proptest;
mod object;
pub mod pool;
mod segment;
pub mod traits;

// Public surface
pub use array::Array;
pub use bloom::{Bloom, BloomFilter, NoBloom};
pub use bucket_set::BucketHashSet;
pub use error::{Error, Result};
pub use merge_map::MergeMap;
pub use merge_set::{InsertResult, MergeSet, Position};
pub use traits::{
    First, HashTraits, Identity, KeyOf, LessTraits, MergeTraits, NothrowLessTraits, OrderMode,
};
