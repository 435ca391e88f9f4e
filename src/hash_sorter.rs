//! HashSorter: order a slice by hash code and search it by interpolation.
//!
//! `sort` is an MSB-first radix sort over 8-bit digits of the 64-bit hash,
//! falling back to selection sort for ranges of at most 32 items. Within a
//! run of equal hashes a grouping pass makes equal items adjacent, so after
//! sorting every equal-key run is contiguous and runs appear in ascending
//! hash order.
//!
//! `find` and `equal_range` first locate *a* slot with the wanted hash by
//! interpolation (the hash is treated as a fraction of the index space), with
//! up to three correction steps depending on the slice length, then fall back
//! to exponential or binary search. From that slot they walk the hash run in
//! both directions, skipping whole equal-key runs by exponential search.
//!
//! The `*_prehashed` variants read hashes from a parallel slice instead of
//! calling the hash function; sorting keeps both slices in step.

use core::cmp::Ordering;
use core::ops::Range;

use crate::error::Result;

const RADIX_SIZE: u32 = 8;
const RADIX_COUNT: usize = 1 << RADIX_SIZE;
const SELECTION_SORT_MAX: usize = 1 << (RADIX_SIZE / 2 + 1);

/// Sort `items` by `hash`, grouping items that are `equal` within each
/// equal-hash run.
pub fn sort<T, H, E>(items: &mut [T], hash: H, equal: E)
where
    H: Fn(&T) -> u64,
    E: Fn(&T, &T) -> bool,
{
    let count = items.len();
    let mut access = ByFn { items, hash, equal };
    sort_range(&mut access, 0, count, u64::BITS - RADIX_SIZE);
}

/// Hash every item into a new array, then sort both together.
pub fn sort_hashed<T, H, E>(items: &mut [T], hash: H, equal: E) -> Result<Vec<u64>>
where
    H: Fn(&T) -> u64,
    E: Fn(&T, &T) -> bool,
{
    let mut hashes = Vec::new();
    hashes.try_reserve_exact(items.len())?;
    hashes.extend(items.iter().map(&hash));
    sort_prehashed(items, &mut hashes, equal);
    Ok(hashes)
}

/// Sort `items` by the parallel `hashes` slice, swapping both in step.
///
/// # Panics
/// If the two slices differ in length.
pub fn sort_prehashed<T, E>(items: &mut [T], hashes: &mut [u64], equal: E)
where
    E: Fn(&T, &T) -> bool,
{
    assert_eq!(items.len(), hashes.len(), "item and hash slices differ in length");
    let count = items.len();
    let mut access = Prehashed {
        items,
        hashes,
        equal,
    };
    sort_range(&mut access, 0, count, u64::BITS - RADIX_SIZE);
}

/// True if hashes ascend and equal items are adjacent within every
/// equal-hash run.
pub fn is_sorted<T, H, E>(items: &[T], hash: H, equal: E) -> bool
where
    H: Fn(&T) -> u64,
    E: Fn(&T, &T) -> bool,
{
    is_sorted_by(items.len(), |i| hash(&items[i]), |i, j| equal(&items[i], &items[j]))
}

pub fn is_sorted_prehashed<T, E>(items: &[T], hashes: &[u64], equal: E) -> bool
where
    E: Fn(&T, &T) -> bool,
{
    debug_assert_eq!(items.len(), hashes.len());
    is_sorted_by(items.len(), |i| hashes[i], |i, j| equal(&items[i], &items[j]))
}

/// Search a sorted slice for an item equal to `item`. Like
/// `slice::binary_search`, returns `Ok(index)` on a hit and `Err(index)`
/// with a position inside the hash order otherwise.
pub fn find<T, H, E>(items: &[T], item: &T, hash: H, equal: E) -> core::result::Result<usize, usize>
where
    H: Fn(&T) -> u64,
    E: Fn(&T, &T) -> bool,
{
    let item_hash = hash(item);
    find_by(
        items.len(),
        item_hash,
        |i| hash(&items[i]),
        |i| equal(&items[i], item),
        |i, j| equal(&items[i], &items[j]),
    )
}

pub fn find_prehashed<T, E>(
    items: &[T],
    hashes: &[u64],
    item: &T,
    item_hash: u64,
    equal: E,
) -> core::result::Result<usize, usize>
where
    E: Fn(&T, &T) -> bool,
{
    debug_assert_eq!(items.len(), hashes.len());
    find_by(
        items.len(),
        item_hash,
        |i| hashes[i],
        |i| equal(&items[i], item),
        |i, j| equal(&items[i], &items[j]),
    )
}

/// Index range of the run of items equal to `item`; empty if absent.
pub fn equal_range<T, H, E>(items: &[T], item: &T, hash: H, equal: E) -> Range<usize>
where
    H: Fn(&T) -> u64,
    E: Fn(&T, &T) -> bool,
{
    let item_hash = hash(item);
    equal_range_by(
        items.len(),
        item_hash,
        |i| hash(&items[i]),
        |i| equal(&items[i], item),
        |i, j| equal(&items[i], &items[j]),
    )
}

pub fn equal_range_prehashed<T, E>(
    items: &[T],
    hashes: &[u64],
    item: &T,
    item_hash: u64,
    equal: E,
) -> Range<usize>
where
    E: Fn(&T, &T) -> bool,
{
    debug_assert_eq!(items.len(), hashes.len());
    equal_range_by(
        items.len(),
        item_hash,
        |i| hashes[i],
        |i| equal(&items[i], item),
        |i, j| equal(&items[i], &items[j]),
    )
}

/// The run of items equal to `item`, as a subslice.
#[inline]
pub fn get_bounds<'a, T, H, E>(items: &'a [T], item: &T, hash: H, equal: E) -> &'a [T]
where
    H: Fn(&T) -> u64,
    E: Fn(&T, &T) -> bool,
{
    &items[equal_range(items, item, hash, equal)]
}

#[inline]
pub fn get_bounds_prehashed<'a, T, E>(
    items: &'a [T],
    hashes: &[u64],
    item: &T,
    item_hash: u64,
    equal: E,
) -> &'a [T]
where
    E: Fn(&T, &T) -> bool,
{
    &items[equal_range_prehashed(items, hashes, item, item_hash, equal)]
}

// ---------------------------------------------------------------------------
// sorting

trait SortAccess {
    fn hash(&self, i: usize) -> u64;
    fn equal(&self, i: usize, j: usize) -> bool;
    fn swap(&mut self, i: usize, j: usize);
}

struct ByFn<'a, T, H, E> {
    items: &'a mut [T],
    hash: H,
    equal: E,
}

impl<T, H, E> SortAccess for ByFn<'_, T, H, E>
where
    H: Fn(&T) -> u64,
    E: Fn(&T, &T) -> bool,
{
    #[inline]
    fn hash(&self, i: usize) -> u64 {
        (self.hash)(&self.items[i])
    }

    #[inline]
    fn equal(&self, i: usize, j: usize) -> bool {
        (self.equal)(&self.items[i], &self.items[j])
    }

    #[inline]
    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
    }
}

struct Prehashed<'a, T, E> {
    items: &'a mut [T],
    hashes: &'a mut [u64],
    equal: E,
}

impl<T, E> SortAccess for Prehashed<'_, T, E>
where
    E: Fn(&T, &T) -> bool,
{
    #[inline]
    fn hash(&self, i: usize) -> u64 {
        self.hashes[i]
    }

    #[inline]
    fn equal(&self, i: usize, j: usize) -> bool {
        (self.equal)(&self.items[i], &self.items[j])
    }

    #[inline]
    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        self.hashes.swap(i, j);
    }
}

fn sort_range<A: SortAccess>(acc: &mut A, begin: usize, count: usize, shift: u32) {
    match count {
        0 | 1 => {}
        2 => {
            if acc.hash(begin) > acc.hash(begin + 1) {
                acc.swap(begin, begin + 1);
            }
        }
        _ if count <= SELECTION_SORT_MAX => selection_sort(acc, begin, count),
        _ => radix_sort(acc, begin, count, shift),
    }
}

fn selection_sort<A: SortAccess>(acc: &mut A, begin: usize, count: usize) {
    let mut hashes = [0u64; SELECTION_SORT_MAX];
    for (i, h) in hashes[..count].iter_mut().enumerate() {
        *h = acc.hash(begin + i);
    }
    for i in 0..count - 1 {
        let mut min = i + 1;
        for j in i + 2..count {
            if hashes[j] < hashes[min] {
                min = j;
            }
        }
        if hashes[min] < hashes[i] {
            acc.swap(begin + i, begin + min);
            hashes.swap(i, min);
        }
    }
    let mut prev = 0;
    for i in 1..count {
        if hashes[i] != hashes[prev] {
            group_if(acc, begin + prev, i - prev);
            prev = i;
        }
    }
    group_if(acc, begin + prev, count - prev);
}

#[inline]
fn radix(hash: u64, shift: u32) -> usize {
    ((hash >> shift) as usize) & (RADIX_COUNT - 1)
}

fn radix_sort<A: SortAccess>(acc: &mut A, begin: usize, count: usize, shift: u32) {
    let mut end_indices = [0usize; RADIX_COUNT];
    let hash0 = acc.hash(begin);
    end_indices[radix(hash0, shift)] += 1;
    let mut single_hash = true;
    for i in 1..count {
        let hash = acc.hash(begin + i);
        end_indices[radix(hash, shift)] += 1;
        single_hash &= hash == hash0;
    }
    if single_hash {
        return group(acc, begin, count);
    }
    for r in 1..RADIX_COUNT {
        end_indices[r] += end_indices[r - 1];
    }
    distribute(acc, begin, shift, &end_indices);

    let next_shift = shift.saturating_sub(RADIX_SIZE);
    let mut start = 0;
    for &end in end_indices.iter() {
        if shift > 0 {
            sort_range(acc, begin + start, end - start, next_shift);
        } else {
            group_if(acc, begin + start, end - start);
        }
        start = end;
    }
}

/// In-place bucket permutation: swap each item into the next free slot of
/// its digit's bucket.
fn distribute<A: SortAccess>(
    acc: &mut A,
    begin: usize,
    shift: u32,
    end_indices: &[usize; RADIX_COUNT],
) {
    let mut begin_indices = [0usize; RADIX_COUNT];
    begin_indices[1..].copy_from_slice(&end_indices[..RADIX_COUNT - 1]);
    for r in 0..RADIX_COUNT {
        while begin_indices[r] < end_indices[r] {
            let at = begin_indices[r];
            let digit = radix(acc.hash(begin + at), shift);
            if digit != r {
                acc.swap(begin + at, begin + begin_indices[digit]);
            }
            begin_indices[digit] += 1;
        }
    }
}

#[inline]
fn group_if<A: SortAccess>(acc: &mut A, begin: usize, count: usize) {
    if count > 2 {
        group(acc, begin, count);
    }
}

fn group<A: SortAccess>(acc: &mut A, begin: usize, count: usize) {
    let mut i = 1;
    while i < count {
        if !acc.equal(begin + i - 1, begin + i) {
            let mut j = i + 1;
            while j < count {
                if acc.equal(begin + i - 1, begin + j) {
                    acc.swap(begin + i, begin + j);
                    i += 1;
                }
                j += 1;
            }
        }
        i += 1;
    }
}

fn is_grouped<E>(begin: usize, count: usize, equal: &E) -> bool
where
    E: Fn(usize, usize) -> bool,
{
    for i in 1..count {
        if equal(begin + i - 1, begin + i) {
            continue;
        }
        if (i + 1..count).any(|j| equal(begin + i - 1, begin + j)) {
            return false;
        }
    }
    true
}

fn is_sorted_by<H, E>(count: usize, hash_at: H, equal: E) -> bool
where
    H: Fn(usize) -> u64,
    E: Fn(usize, usize) -> bool,
{
    if count == 0 {
        return true;
    }
    let mut prev_index = 0;
    let mut prev_hash = hash_at(0);
    for i in 1..count {
        let hash = hash_at(i);
        if hash < prev_hash {
            return false;
        }
        if hash != prev_hash {
            if !is_grouped(prev_index, i - prev_index, &equal) {
                return false;
            }
            prev_index = i;
            prev_hash = hash;
        }
    }
    is_grouped(prev_index, count - prev_index, &equal)
}

// ---------------------------------------------------------------------------
// searching

/// `a * b / 2^64` without a 128-bit product; drops the low-by-low term.
#[inline]
fn mult_shift(a: u64, b: u64) -> u64 {
    const HALF: u32 = 32;
    const MASK: u64 = (1 << HALF) - 1;
    (a >> HALF) * (b >> HALF)
        + (((a >> HALF) * (b & MASK)) >> HALF)
        + (((b >> HALF) * (a & MASK)) >> HALF)
}

/// Scan direction over an index space: virtual offset `k` maps to
/// `origin + k` or `origin - k`.
#[derive(Clone, Copy)]
struct Dir {
    origin: usize,
    forward: bool,
}

impl Dir {
    #[inline]
    fn at(self, k: usize) -> usize {
        if self.forward {
            self.origin + k
        } else {
            self.origin - k
        }
    }
}

/// `Ordering::Less` from `cmp` means the target lies further along.
fn binary_search<C>(left: usize, right: usize, cmp: &C) -> (usize, bool)
where
    C: Fn(usize) -> Ordering,
{
    let (mut left, mut right) = (left, right);
    while left < right {
        let middle = left + (right - left) / 2;
        match cmp(middle) {
            Ordering::Less => left = middle + 1,
            Ordering::Greater => right = middle,
            Ordering::Equal => return (middle, true),
        }
    }
    (left, false)
}

/// Probe offsets 0, 2, 6, 14, ... then binary-search the bracket.
fn exponential_search<C>(count: usize, cmp: &C) -> (usize, bool)
where
    C: Fn(usize) -> Ordering,
{
    let mut left = 0;
    let mut i = 0;
    while i < count {
        match cmp(i) {
            Ordering::Greater => return binary_search(left, i, cmp),
            Ordering::Equal => return (i, true),
            Ordering::Less => left = i + 1,
        }
        i = i * 2 + 2;
    }
    binary_search(left, count, cmp)
}

/// Locate some index in `0..count` whose hash equals `item_hash`, or the
/// insertion point when there is none.
pub(crate) fn find_hash<H>(count: usize, item_hash: u64, hash_at: &H) -> (usize, bool)
where
    H: Fn(usize) -> u64,
{
    if count == 0 {
        return (0, false);
    }
    let n = count as u64;
    let mut left = 0usize;
    let mut right = count;
    let mut middle = mult_shift(item_hash, n) as usize;
    let mut step = if count < 1 << 6 {
        0
    } else if count < 1 << 12 {
        1
    } else if count < 1 << 22 {
        2
    } else {
        3
    };
    loop {
        let middle_hash = hash_at(middle);
        match middle_hash.cmp(&item_hash) {
            Ordering::Less => {
                left = middle + 1;
                if step == 0 {
                    let cmp = |k: usize| hash_at(left + k).cmp(&item_hash);
                    let (k, found) = exponential_search(right - left, &cmp);
                    return (left + k, found);
                }
                middle += mult_shift(item_hash - middle_hash, n) as usize;
                if middle >= right {
                    break;
                }
            }
            Ordering::Greater => {
                right = middle;
                if step == 0 {
                    let cmp = |k: usize| hash_at(right - 1 - k).cmp(&item_hash).reverse();
                    let (k, found) = exponential_search(right - left, &cmp);
                    return (right - k - usize::from(found), found);
                }
                let diff = mult_shift(middle_hash - item_hash, n) as usize;
                if left + diff > middle {
                    break;
                }
                middle -= diff;
            }
            Ordering::Equal => return (middle, true),
        }
        step -= 1;
    }
    let cmp = |k: usize| hash_at(left + k).cmp(&item_hash);
    let (k, found) = binary_search(0, right - left, &cmp);
    (left + k, found)
}

/// Virtual offset of the first item after the equal-item run that starts at
/// offset `start`, scanning at most `count` items from `start`.
fn find_other<E>(dir: Dir, start: usize, count: usize, equal: &E) -> usize
where
    E: Fn(usize, usize) -> bool,
{
    debug_assert!(count > 0);
    let first = dir.at(start);
    let cmp = |k: usize| {
        if equal(first, dir.at(start + 1 + k)) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    };
    start + 1 + exponential_search(count - 1, &cmp).0
}

/// Walk equal-item runs from offset 0 while the hash still matches, looking
/// for an item that `matches`. Returns the virtual offset reached.
fn find_next<H, M, E>(
    dir: Dir,
    count: usize,
    item_hash: u64,
    hash_at: &H,
    matches: &M,
    equal: &E,
) -> (usize, bool)
where
    H: Fn(usize) -> u64,
    M: Fn(usize) -> bool,
    E: Fn(usize, usize) -> bool,
{
    let mut k = 0;
    loop {
        k = find_other(dir, k, count - k, equal);
        if k == count || hash_at(dir.at(k)) != item_hash {
            return (k, false);
        }
        if matches(dir.at(k)) {
            return (k, true);
        }
    }
}

pub(crate) fn find_by<H, M, E>(
    count: usize,
    item_hash: u64,
    hash_at: H,
    matches: M,
    equal: E,
) -> core::result::Result<usize, usize>
where
    H: Fn(usize) -> u64,
    M: Fn(usize) -> bool,
    E: Fn(usize, usize) -> bool,
{
    let (pos, found) = find_hash(count, item_hash, &hash_at);
    if !found {
        return Err(pos);
    }
    if matches(pos) {
        return Ok(pos);
    }
    let back = Dir { origin: pos, forward: false };
    let (k, found) = find_next(back, pos + 1, item_hash, &hash_at, &matches, &equal);
    if found {
        return Ok(back.at(k));
    }
    let ahead = Dir { origin: pos, forward: true };
    match find_next(ahead, count - pos, item_hash, &hash_at, &matches, &equal) {
        (k, true) => Ok(ahead.at(k)),
        (k, false) => Err(ahead.at(k)),
    }
}

fn equal_range_by<H, M, E>(
    count: usize,
    item_hash: u64,
    hash_at: H,
    matches: M,
    equal: E,
) -> Range<usize>
where
    H: Fn(usize) -> u64,
    M: Fn(usize) -> bool,
    E: Fn(usize, usize) -> bool,
{
    let (pos, found) = find_hash(count, item_hash, &hash_at);
    if !found {
        return pos..pos;
    }
    let back = Dir { origin: pos, forward: false };
    let ahead = Dir { origin: pos, forward: true };
    if matches(pos) {
        let start = pos + 1 - find_other(back, 0, pos + 1, &equal);
        let end = ahead.at(find_other(ahead, 0, count - pos, &equal));
        return start..end;
    }
    let (k, found) = find_next(back, pos + 1, item_hash, &hash_at, &matches, &equal);
    if found {
        let hit = back.at(k);
        let run = Dir { origin: hit, forward: false };
        let start = hit + 1 - find_other(run, 0, hit + 1, &equal);
        return start..hit + 1;
    }
    match find_next(ahead, count - pos, item_hash, &hash_at, &matches, &equal) {
        (k, true) => {
            let hit = ahead.at(k);
            let run = Dir { origin: hit, forward: true };
            hit..run.at(find_other(run, 0, count - hit, &equal))
        }
        (k, false) => ahead.at(k)..ahead.at(k),
    }
}
