//! MergeSet: a set stored as a stack of geometrically sized segments.
//!
//! New items land in the small unsorted segment 0. When it is full, the
//! smallest segment `k` able to hold segments `0..=k` together is rebuilt as
//! one sorted buffer and a fresh segment 0 receives the new item. Lookups
//! search the sorted segments from the oldest (largest) down, then scan
//! segment 0.
//!
//! Sorted segments are ordered by hash code in `OrderMode::Hash` (searched
//! with `hash_sorter`) or by key in the `Less*` modes (searched by lower
//! bound). Only hash-ordered sets support removing single items: segment 0
//! swap-removes, sorted segments tombstone the slot and are freed once empty.
//!
//! Every insert is two-phase. All buffers the merge needs are allocated
//! first; then the item constructor runs, user hashing and ordering compute
//! the final layout, and only then are items relocated. An error or panic
//! before relocation frees the fresh buffers and leaves the set unchanged.

use core::cmp::Ordering;
use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::ops::Range;

use crate::array::Array;
use crate::bloom::BloomFilter;
use crate::check::{DebugReentrancy, Version};
use crate::error::{Error, Result};
use crate::hash_sorter;
use crate::segment::{Segment, Slots, SlotsMut};
use crate::traits::{HashTraits, Identity, KeyOf, MergeTraits, OrderMode};

type BloomOf<T, Tr, KO> = <Tr as MergeTraits<<KO as KeyOf<T>>::Key>>::Bloom;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Slot {
    segment: usize,
    index: usize,
}

/// Result of a lookup, valid until the next structural mutation.
///
/// A position either refers to an item or records that the key was absent;
/// the latter can be passed to [`MergeSet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Position {
    slot: Option<Slot>,
    version: u64,
}

impl Position {
    #[inline]
    pub fn is_found(&self) -> bool {
        self.slot.is_some()
    }
}

/// Outcome of `insert`: where the key lives and whether it was added now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub position: Position,
    pub inserted: bool,
}

/// Source item of a merge with the hash it is ordered (or filtered) by.
struct Entry<T> {
    hash: u64,
    item: *mut T,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Entry<T> {}

/// Buffers for one grow-and-merge, allocated before anything moves.
struct MergePlan<T, B> {
    target_index: usize,
    fresh: Segment<T, B>,
    target: Segment<T, B>,
    entries: Vec<Entry<T>>,
    spare: Vec<Entry<T>>,
    runs: Vec<Range<usize>>,
}

enum Reserved<T, B> {
    /// Segment 0 has a free slot.
    Fast,
    Merge(MergePlan<T, B>),
}

/// Segment stack and bookkeeping. Kept apart from the reentrancy tracker so
/// a guard can stay alive across `&mut` calls.
struct Stack<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    segments: Array<Segment<T, Tr::Bloom>>,
    len: usize,
    version: Version,
    traits: Tr,
    _key: PhantomData<fn() -> KO>,
}

impl<T, Tr, KO> Stack<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    fn new(traits: Tr) -> Self {
        Self {
            segments: Array::new(),
            len: 0,
            version: Version::new(),
            traits,
            _key: PhantomData,
        }
    }

    #[inline]
    fn needs_hash() -> bool {
        Tr::MODE.is_hash() || !<Tr::Bloom as BloomFilter>::IS_ALWAYS_EMPTY
    }

    #[inline]
    fn hash_of(&self, key: &KO::Key) -> u64 {
        if Self::needs_hash() {
            self.traits.hash_code(key)
        } else {
            0
        }
    }

    #[inline]
    fn position(&self, slot: Option<Slot>) -> Position {
        Position { slot, version: self.version.get() }
    }

    fn order(&self, a: &KO::Key, b: &KO::Key) -> Ordering {
        if self.traits.is_less(a, b) {
            Ordering::Less
        } else if self.traits.is_less(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    #[inline]
    fn entry_less(&self, a: &Entry<T>, b: &Entry<T>) -> bool {
        if Tr::MODE.is_hash() {
            a.hash < b.hash
        } else {
            unsafe { self.traits.is_less(KO::key(&*a.item), KO::key(&*b.item)) }
        }
    }

    fn slot_item(&self, slot: Slot) -> Option<&T> {
        self.segments.as_slice().get(slot.segment)?.get(slot.index)
    }

    fn slot_item_mut(&mut self, slot: Slot) -> Option<&mut T> {
        self.segments.as_mut_slice().get_mut(slot.segment)?.get_mut(slot.index)
    }

    fn find_slot(&self, key: &KO::Key) -> Option<Slot> {
        let hash = self.hash_of(key);
        let segments = self.segments.as_slice();
        for (segment, seg) in segments.iter().enumerate().skip(1).rev() {
            if seg.live() == 0 || !seg.bloom().test(hash) {
                continue;
            }
            if let Some(index) = self.find_in_sorted(seg, key, hash) {
                return Some(Slot { segment, index });
            }
        }
        let seg0 = segments.first()?;
        let index = seg0
            .as_slice()
            .iter()
            .position(|item| self.traits.is_equal(KO::key(item), key))?;
        Some(Slot { segment: 0, index })
    }

    fn find_in_sorted(
        &self,
        seg: &Segment<T, Tr::Bloom>,
        key: &KO::Key,
        hash: u64,
    ) -> Option<usize> {
        if !Tr::MODE.is_hash() {
            let items = seg.as_slice();
            let index = items.partition_point(|item| self.traits.is_less(KO::key(item), key));
            let item = items.get(index)?;
            return self.traits.is_equal(KO::key(item), key).then_some(index);
        }
        let hashes = seg.hashes();
        let (start, found) = hash_sorter::find_hash(hashes.len(), hash, &|i| hashes[i]);
        if !found {
            return None;
        }
        let matches = |i: usize| {
            seg.get(i).is_some_and(|item| self.traits.is_equal(KO::key(item), key))
        };
        let before = (0..=start).rev().take_while(|&i| hashes[i] == hash);
        let after = (start + 1..hashes.len()).take_while(|&i| hashes[i] == hash);
        before.chain(after).find(|&i| matches(i))
    }

    /// Phase one of an insert: secure a slot without touching any item.
    fn reserve(&mut self) -> Result<Reserved<T, Tr::Bloom>> {
        if self.segments.is_empty() {
            self.segments.push(Segment::empty())?;
        }
        let seg0 = &mut self.segments[0];
        if !seg0.is_allocated() {
            *seg0 = Segment::allocate(Tr::segment_item_count(0), false)?;
        }
        if seg0.has_room() {
            return Ok(Reserved::Fast);
        }
        self.plan_merge().map(Reserved::Merge)
    }

    fn plan_merge(&mut self) -> Result<MergePlan<T, Tr::Bloom>> {
        let mut total = self.segments[0].live();
        let mut k = 1;
        loop {
            if let Some(seg) = self.segments.as_slice().get(k) {
                total += seg.live();
            }
            if total <= Tr::segment_item_count(k) {
                break;
            }
            k += 1;
        }
        while self.segments.len() <= k {
            self.segments.push(Segment::empty())?;
        }
        let fresh = Segment::allocate(Tr::segment_item_count(0), false)?;
        let mut target = Segment::allocate(Tr::segment_item_count(k), Tr::MODE.is_hash())?;
        target.init_bloom();
        let mut entries = Vec::new();
        entries.try_reserve_exact(total)?;
        let mut spare = Vec::new();
        if Tr::MODE == OrderMode::LessThrow {
            spare.try_reserve_exact(total)?;
        }
        let mut runs = Vec::new();
        runs.try_reserve_exact(k + 1)?;
        Ok(MergePlan { target_index: k, fresh, target, entries, spare, runs })
    }

    /// Phase two: build the item and, on the merge path, rebuild segment `k`.
    /// Cannot fail; panics from user code leave the set as it was.
    fn commit<F>(&mut self, reserved: Reserved<T, Tr::Bloom>, creator: F) -> Slot
    where
        F: FnOnce() -> T,
    {
        let slot = match reserved {
            Reserved::Fast => {
                let index = self.segments[0].push_with(creator);
                Slot { segment: 0, index }
            }
            Reserved::Merge(plan) => self.merge(plan, creator),
        };
        self.len += 1;
        self.version.bump();
        slot
    }

    fn merge<F>(&mut self, mut plan: MergePlan<T, Tr::Bloom>, creator: F) -> Slot
    where
        F: FnOnce() -> T,
    {
        let k = plan.target_index;
        plan.fresh.push_with(creator);
        self.collect_runs(&mut plan);
        if Tr::MODE == OrderMode::LessThrow {
            self.merge_runs_ordered(&mut plan);
        }

        let MergePlan { fresh, mut target, entries, mut runs, .. } = plan;
        // Items are half moved from here on; an unwind cannot be recovered.
        let abort = scopeguard::guard_on_unwind((), |()| std::process::abort());
        loop {
            let mut best: Option<usize> = None;
            for (r, run) in runs.iter().enumerate() {
                if run.is_empty() {
                    continue;
                }
                best = match best {
                    Some(b) if !self.entry_less(&entries[run.start], &entries[runs[b].start]) => {
                        Some(b)
                    }
                    _ => Some(r),
                };
            }
            let Some(r) = best else { break };
            let entry = entries[runs[r].start];
            runs[r].start += 1;
            unsafe { target.push_relocated(entry.item, entry.hash) };
        }
        for seg in &mut self.segments[..=k] {
            seg.forget_items();
            *seg = Segment::empty();
        }
        scopeguard::ScopeGuard::into_inner(abort);

        log::trace!(
            "merged segments 0..={k} into segment {k}: {} of {} slots",
            target.live(),
            target.capacity()
        );
        self.segments[k] = target;
        self.segments[0] = fresh;
        Slot { segment: 0, index: 0 }
    }

    /// Lay out the live items of segments `0..=k` as sorted runs of entries.
    /// Runs user hashing and ordering; moves nothing.
    fn collect_runs(&self, plan: &mut MergePlan<T, Tr::Bloom>) {
        let MergePlan { target_index, entries, runs, .. } = plan;
        let seg0 = &self.segments[0];
        for index in 0..seg0.filled() {
            let item = seg0.slot_ptr(index);
            let hash = self.hash_of(KO::key(unsafe { &*item }));
            entries.push(Entry { hash, item });
        }
        if Tr::MODE.is_hash() {
            hash_sorter::sort(
                entries,
                |e| e.hash,
                |a, b| unsafe { self.traits.is_equal(KO::key(&*a.item), KO::key(&*b.item)) },
            );
        } else {
            entries.sort_unstable_by(|a, b| unsafe {
                self.order(KO::key(&*a.item), KO::key(&*b.item))
            });
        }
        runs.push(0..entries.len());

        for seg in &self.segments[1..=*target_index] {
            let begin = entries.len();
            for index in 0..seg.filled() {
                let Some(item) = seg.get(index) else { continue };
                let hash = match seg.hashes().get(index) {
                    Some(&hash) => hash,
                    None => self.hash_of(KO::key(item)),
                };
                entries.push(Entry { hash, item: seg.slot_ptr(index) });
            }
            runs.push(begin..entries.len());
        }
    }

    /// Fold all runs into one with pairwise merges. Comparisons may panic.
    fn merge_runs_ordered(&self, plan: &mut MergePlan<T, Tr::Bloom>) {
        let MergePlan { entries, spare, runs, .. } = plan;
        let mut merged = runs.first().map_or(0, |run| run.end);
        for run in runs.iter().skip(1) {
            spare.clear();
            let (left, right) = entries[..run.end].split_at(merged);
            let (mut i, mut j) = (0, 0);
            while i < left.len() && j < right.len() {
                if self.entry_less(&right[j], &left[i]) {
                    spare.push(right[j]);
                    j += 1;
                } else {
                    spare.push(left[i]);
                    i += 1;
                }
            }
            spare.extend_from_slice(&left[i..]);
            spare.extend_from_slice(&right[j..]);
            entries[..run.end].copy_from_slice(&spare[..]);
            merged = run.end;
        }
        runs.clear();
        runs.push(0..merged);
    }

    /// Move the live item at `slot` out. Sorted segments must have a
    /// tombstone bitmap when more than one item is live.
    fn take_slot(&mut self, slot: Slot) -> T {
        let seg = &mut self.segments[slot.segment];
        let item = if slot.segment == 0 {
            seg.swap_remove(slot.index)
        } else {
            let item = seg.take(slot.index);
            if seg.live() == 0 {
                *seg = Segment::empty();
            }
            item
        };
        self.len -= 1;
        self.version.bump();
        item
    }

    fn prepare_take(&mut self, slot: Slot) -> Result<()> {
        if !Tr::MODE.is_hash() {
            return Err(Error::Unsupported("single-item removal requires hash ordering"));
        }
        let seg = self.segments.as_mut_slice().get_mut(slot.segment).ok_or(Error::EmptyPosition)?;
        if !seg.is_live(slot.index) {
            return Err(Error::EmptyPosition);
        }
        if slot.segment > 0 && seg.live() > 1 {
            seg.ensure_tombstones()?;
        }
        Ok(())
    }

    fn add_new<F>(&mut self, creator: F) -> Result<Slot>
    where
        F: FnOnce() -> T,
    {
        let reserved = self.reserve()?;
        let slot = self.commit(reserved, creator);
        self.debug_check(slot);
        Ok(slot)
    }

    /// Insert an item known to be absent, handing it back on failure.
    fn add_value(&mut self, item: T) -> core::result::Result<Slot, (Error, T)> {
        match self.reserve() {
            Ok(reserved) => {
                let slot = self.commit(reserved, || item);
                self.debug_check(slot);
                Ok(slot)
            }
            Err(err) => Err((err, item)),
        }
    }

    #[cfg(debug_assertions)]
    fn debug_check(&self, slot: Slot) {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        // A panicking hash or comparator only fails the check.
        let found = catch_unwind(AssertUnwindSafe(|| {
            self.slot_item(slot).is_some_and(|item| self.find_slot(KO::key(item)) == Some(slot))
        }));
        debug_assert!(found.unwrap_or(false), "inserted item is not findable");
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn debug_check(&self, _slot: Slot) {}

    fn remove_if<P>(&mut self, mut pred: P) -> Result<usize>
    where
        P: FnMut(&T) -> bool,
    {
        if !Tr::MODE.is_hash() {
            return Err(Error::Unsupported("remove_if requires hash ordering"));
        }
        let mut removed = 0;
        for segment in 0..self.segments.len() {
            let mut index = 0;
            while index < self.segments[segment].filled() {
                let slot = Slot { segment, index };
                if !self.slot_item(slot).is_some_and(&mut pred) {
                    index += 1;
                    continue;
                }
                self.prepare_take(slot)?;
                drop(self.take_slot(slot));
                removed += 1;
                if segment > 0 {
                    index += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Move every item of `other` whose key is absent here. Items stay in
    /// `other` until a slot here has been reserved for them, so an error
    /// leaves every item in one of the two sets.
    ///
    /// Sorted segments of `other` are tombstoned while items leave them. In
    /// key order those holes are closed again on every exit, since key-ordered
    /// lookups assume dense segments.
    fn merge_stack(&mut self, other: &mut Self) -> Result<()> {
        let dense = !Tr::MODE.is_hash();
        let mut source = scopeguard::guard(other, |source| {
            if dense {
                source.compact_sorted();
            }
        });
        for segment in (0..source.segments.len()).rev() {
            if segment > 0 && source.segments[segment].live() > 1 {
                source.segments[segment].ensure_tombstones()?;
            }
            let filled = source.segments[segment].filled();
            for step in 0..filled {
                let index = if segment == 0 { filled - 1 - step } else { step };
                let slot = Slot { segment, index };
                let Some(item) = source.slot_item(slot) else { continue };
                if self.find_slot(KO::key(item)).is_some() {
                    continue;
                }
                let reserved = self.reserve()?;
                let item = source.take_slot(slot);
                let added = self.commit(reserved, || item);
                self.debug_check(added);
            }
        }
        Ok(())
    }

    fn compact_sorted(&mut self) {
        for seg in self.segments.iter_mut().skip(1) {
            seg.compact();
        }
    }

    fn clear(&mut self) {
        self.segments = Array::new();
        self.len = 0;
        self.version.bump();
    }

    fn try_clone(&self) -> Result<Self>
    where
        T: Clone,
    {
        let mut segments = Array::with_capacity(self.segments.len())?;
        for seg in self.segments.iter() {
            segments.push(seg.try_clone()?)?;
        }
        Ok(Self {
            segments,
            len: self.len,
            version: Version::new(),
            traits: self.traits.clone(),
            _key: PhantomData,
        })
    }

    fn into_iter(self) -> IntoIter<T, Tr::Bloom> {
        IntoIter { remaining: self.len, segments: self.segments }
    }
}

/// Segmented set with merge growth. See the module docs.
///
/// `Tr` fixes ordering, hashing, segment sizes and the Bloom filter; `KO`
/// selects the key of an item (`Identity` for plain sets).
pub struct MergeSet<T, Tr = HashTraits, KO = Identity>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    stack: Stack<T, Tr, KO>,
    reentrancy: DebugReentrancy,
}

impl<T, Tr, KO> MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    pub fn new() -> Self
    where
        Tr: Default,
    {
        Self::with_traits(Tr::default())
    }

    pub fn with_traits(traits: Tr) -> Self {
        Self { stack: Stack::new(traits), reentrancy: DebugReentrancy::new() }
    }

    pub fn traits(&self) -> &Tr {
        &self.stack.traits
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stack.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stack.len == 0
    }

    /// Number of segments currently holding items.
    pub fn segment_count(&self) -> usize {
        self.stack.segments.iter().filter(|seg| seg.live() > 0).count()
    }

    pub fn find(&self, key: &KO::Key) -> Position {
        let _g = self.reentrancy.enter();
        self.stack.position(self.stack.find_slot(key))
    }

    pub fn contains(&self, key: &KO::Key) -> bool {
        let _g = self.reentrancy.enter();
        self.stack.find_slot(key).is_some()
    }

    pub fn get(&self, key: &KO::Key) -> Option<&T> {
        let _g = self.reentrancy.enter();
        let slot = self.stack.find_slot(key)?;
        self.stack.slot_item(slot)
    }

    /// Item at `pos`.
    pub fn at(&self, pos: Position) -> Result<&T> {
        contract!(pos.version == self.stack.version.get(), Error::InvalidatedPosition);
        let slot = pos.slot.ok_or(Error::EmptyPosition)?;
        self.stack.slot_item(slot).ok_or(Error::EmptyPosition)
    }

    /// Mutable access for the map adaptor; the key part must not change.
    pub(crate) fn at_mut(&mut self, pos: Position) -> Result<&mut T> {
        contract!(pos.version == self.stack.version.get(), Error::InvalidatedPosition);
        let slot = pos.slot.ok_or(Error::EmptyPosition)?;
        self.stack.slot_item_mut(slot).ok_or(Error::EmptyPosition)
    }

    pub(crate) fn get_mut(&mut self, key: &KO::Key) -> Option<&mut T> {
        let _g = self.reentrancy.enter();
        let slot = self.stack.find_slot(key)?;
        self.stack.slot_item_mut(slot)
    }

    /// Insert `item` unless its key is present; an existing item is kept and
    /// `item` is dropped.
    pub fn insert(&mut self, item: T) -> Result<InsertResult> {
        let _g = self.reentrancy.enter();
        if let Some(slot) = self.stack.find_slot(KO::key(&item)) {
            return Ok(InsertResult { position: self.stack.position(Some(slot)), inserted: false });
        }
        let slot = self.stack.add_new(|| item)?;
        Ok(InsertResult { position: self.stack.position(Some(slot)), inserted: true })
    }

    /// Insert the item built by `creator` unless `key` is present. The creator
    /// runs only on insert and must build an item whose key equals `key`.
    pub fn insert_with<F>(&mut self, key: &KO::Key, creator: F) -> Result<InsertResult>
    where
        F: FnOnce() -> T,
    {
        let _g = self.reentrancy.enter();
        if let Some(slot) = self.stack.find_slot(key) {
            return Ok(InsertResult { position: self.stack.position(Some(slot)), inserted: false });
        }
        let slot = self.stack.add_new(creator)?;
        Ok(InsertResult { position: self.stack.position(Some(slot)), inserted: true })
    }

    /// Add the item built by `creator` at a position returned by a failed
    /// `find` for the same key.
    pub fn add<F>(&mut self, pos: Position, creator: F) -> Result<Position>
    where
        F: FnOnce() -> T,
    {
        let _g = self.reentrancy.enter();
        contract!(pos.version == self.stack.version.get(), Error::InvalidatedPosition);
        contract!(pos.slot.is_none(), Error::PositionOccupied);
        let slot = self.stack.add_new(creator)?;
        Ok(self.stack.position(Some(slot)))
    }

    /// Insert every item, skipping keys already present. Stops at the first
    /// error; items inserted before it stay.
    pub fn insert_many<I>(&mut self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T>,
    {
        let mut inserted = 0;
        for item in items {
            if self.insert(item)?.inserted {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Remove and return the item with `key`. Hash-ordered sets only.
    pub fn remove(&mut self, key: &KO::Key) -> Result<Option<T>> {
        let _g = self.reentrancy.enter();
        if !Tr::MODE.is_hash() {
            return Err(Error::Unsupported("single-item removal requires hash ordering"));
        }
        let Some(slot) = self.stack.find_slot(key) else {
            return Ok(None);
        };
        self.stack.prepare_take(slot)?;
        Ok(Some(self.stack.take_slot(slot)))
    }

    /// Remove and return the item at `pos`. Hash-ordered sets only.
    pub fn extract(&mut self, pos: Position) -> Result<T> {
        let _g = self.reentrancy.enter();
        contract!(pos.version == self.stack.version.get(), Error::InvalidatedPosition);
        let slot = pos.slot.ok_or(Error::EmptyPosition)?;
        self.stack.prepare_take(slot)?;
        Ok(self.stack.take_slot(slot))
    }

    /// Remove every item matching `pred` and return how many went. A panic
    /// or error part way keeps the removals made so far. Hash-ordered sets
    /// only.
    pub fn remove_if<P>(&mut self, pred: P) -> Result<usize>
    where
        P: FnMut(&T) -> bool,
    {
        let _g = self.reentrancy.enter();
        self.stack.remove_if(pred)
    }

    /// Move into `self` every item of `other` whose key is not already here.
    /// Items with keys present in both stay in `other`. On error both sets
    /// stay valid but the split of items between them is unspecified.
    pub fn merge_from(&mut self, other: &mut Self) -> Result<()> {
        let _g = self.reentrancy.enter();
        let _h = other.reentrancy.enter();
        self.stack.merge_stack(&mut other.stack)
    }

    /// `other.merge_from(self)`.
    pub fn merge_to(&mut self, other: &mut Self) -> Result<()> {
        other.merge_from(self)
    }

    pub fn clear(&mut self) {
        let _g = self.reentrancy.enter();
        self.stack.clear();
    }

    pub fn iter(&self) -> Iter<'_, T, BloomOf<T, Tr, KO>> {
        Iter { segments: self.stack.segments.iter(), current: None, remaining: self.stack.len }
    }

    /// Mutable iteration for the map adaptor; key parts must not change.
    pub(crate) fn iter_mut(&mut self) -> IterMut<'_, T, BloomOf<T, Tr, KO>> {
        IterMut {
            remaining: self.stack.len,
            segments: self.stack.segments.iter_mut(),
            current: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn segments(&self) -> &[Segment<T, BloomOf<T, Tr, KO>>] {
        &self.stack.segments
    }

    pub fn try_clone(&self) -> Result<Self>
    where
        T: Clone,
    {
        let _g = self.reentrancy.enter();
        Ok(Self { stack: self.stack.try_clone()?, reentrancy: DebugReentrancy::new() })
    }
}

impl<T, Tr, KO> Default for MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key> + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, Tr, KO> Clone for MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(copy) => copy,
            Err(err) => panic!("MergeSet::clone: {err}"),
        }
    }
}

impl<T: fmt::Debug, Tr, KO> fmt::Debug for MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T, Tr, KO> Extend<T> for MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    /// Panics if an insert fails.
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            if let Err(err) = self.insert(item) {
                panic!("MergeSet::extend: {err}");
            }
        }
    }
}

impl<T, Tr, KO> FromIterator<T> for MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key> + Default,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl<'a, T, Tr, KO> IntoIterator for &'a MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    type Item = &'a T;
    type IntoIter = Iter<'a, T, BloomOf<T, Tr, KO>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T, Tr, KO> IntoIterator for MergeSet<T, Tr, KO>
where
    KO: KeyOf<T>,
    Tr: MergeTraits<KO::Key>,
{
    type Item = T;
    type IntoIter = IntoIter<T, BloomOf<T, Tr, KO>>;

    fn into_iter(self) -> Self::IntoIter {
        self.stack.into_iter()
    }
}

/// Borrowing iterator over the items of a [`MergeSet`], segment 0 first.
pub struct Iter<'a, T, B> {
    segments: core::slice::Iter<'a, Segment<T, B>>,
    current: Option<Slots<'a, T>>,
    remaining: usize,
}

impl<'a, T, B: BloomFilter> Iterator for Iter<'a, T, B> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            if let Some(item) = self.current.as_mut().and_then(Iterator::next) {
                self.remaining -= 1;
                return Some(item);
            }
            self.current = Some(self.segments.next()?.iter());
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T, B: BloomFilter> ExactSizeIterator for Iter<'_, T, B> {}
impl<T, B: BloomFilter> FusedIterator for Iter<'_, T, B> {}

pub(crate) struct IterMut<'a, T, B> {
    segments: core::slice::IterMut<'a, Segment<T, B>>,
    current: Option<SlotsMut<'a, T>>,
    remaining: usize,
}

impl<'a, T, B: BloomFilter> Iterator for IterMut<'a, T, B> {
    type Item = &'a mut T;

    fn next(&mut self) -> Option<&'a mut T> {
        loop {
            if let Some(item) = self.current.as_mut().and_then(Iterator::next) {
                self.remaining -= 1;
                return Some(item);
            }
            self.current = Some(self.segments.next()?.iter_mut());
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Owning iterator over the items of a [`MergeSet`].
pub struct IntoIter<T, B> {
    segments: Array<Segment<T, B>>,
    remaining: usize,
}

impl<T, B: BloomFilter> Iterator for IntoIter<T, B> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.segments.last_mut()?.pop() {
                self.remaining -= 1;
                return Some(item);
            }
            self.segments.pop();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T, B: BloomFilter> ExactSizeIterator for IntoIter<T, B> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::Bloom;
    use crate::traits::{LessTraits, NothrowLessTraits};
    use core::hash::{BuildHasher, Hash, Hasher};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct IdentityBuild;
    struct IdentityHasher(u64);
    impl Hasher for IdentityHasher {
        fn finish(&self) -> u64 {
            self.0
        }
        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 = self.0.rotate_left(8) ^ u64::from(b);
            }
        }
        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
    }
    impl BuildHasher for IdentityBuild {
        type Hasher = IdentityHasher;
        fn build_hasher(&self) -> IdentityHasher {
            IdentityHasher(0)
        }
    }

    fn shuffled(n: u64, seed: u64) -> Vec<u64> {
        let mut keys: Vec<u64> = (0..n).collect();
        keys.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
        keys
    }

    #[test]
    fn first_merge_moves_segment_zero_up() {
        let mut set: MergeSet<u64> = MergeSet::new();
        for k in 0..8 {
            assert!(set.insert(k).unwrap().inserted);
        }
        assert_eq!(set.segment_count(), 1);
        let res = set.insert(8).unwrap();
        assert!(res.inserted);
        assert_eq!(set.segment_count(), 2);
        assert_eq!(set.at(res.position), Ok(&8));
        for k in 0..9 {
            assert!(set.contains(&k), "missing {k}");
        }
    }

    /// Invariant: every segment holds at most its capacity and the sum of
    /// live counts equals `len`.
    #[test]
    fn segment_counts_stay_within_capacity() {
        let mut set: MergeSet<u64> = MergeSet::new();
        for k in shuffled(3000, 1) {
            set.insert(k).unwrap();
            let segs = set.stack.segments.as_slice();
            let total: usize = segs.iter().map(|s| s.live()).sum();
            assert_eq!(total, set.len());
            for (i, seg) in segs.iter().enumerate() {
                assert!(seg.live() <= <HashTraits as MergeTraits<u64>>::segment_item_count(i));
                if seg.is_allocated() {
                    let expected = <HashTraits as MergeTraits<u64>>::segment_item_count(i);
                    assert_eq!(seg.capacity(), expected);
                }
            }
        }
        assert_eq!(set.len(), 3000);
        assert_eq!(set.iter().count(), 3000);
    }

    #[test]
    fn duplicate_insert_keeps_existing_item() {
        let mut set: MergeSet<(u32, &str), HashTraits, crate::traits::First> = MergeSet::new();
        assert!(set.insert((1, "a")).unwrap().inserted);
        let res = set.insert((1, "b")).unwrap();
        assert!(!res.inserted);
        assert_eq!(set.at(res.position), Ok(&(1, "a")));
        assert_eq!(set.len(), 1);
    }

    /// Inserting two items and removing one leaves the other findable.
    #[test]
    fn insert_two_remove_one() {
        let mut set: MergeSet<String> = MergeSet::new();
        set.insert("kept".to_string()).unwrap();
        set.insert("gone".to_string()).unwrap();
        assert_eq!(set.remove(&"gone".to_string()), Ok(Some("gone".to_string())));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&"kept".to_string()));
        assert!(!set.contains(&"gone".to_string()));
    }

    #[test]
    fn removal_tombstones_and_frees_sorted_segments() {
        let mut set: MergeSet<u64> = MergeSet::new();
        for k in 0..9 {
            set.insert(k).unwrap();
        }
        // 0..8 sit in segment 1, 8 in segment 0.
        for k in 0..8 {
            assert_eq!(set.remove(&k), Ok(Some(k)));
            assert!(!set.contains(&k));
            assert!(set.contains(&8));
        }
        assert_eq!(set.segment_count(), 1);
        assert!(!set.stack.segments[1].is_allocated());
        assert_eq!(set.remove(&8), Ok(Some(8)));
        assert!(set.is_empty());
        assert_eq!(set.remove(&8), Ok(None));
    }

    /// Hash-run scanning skips tombstoned slots.
    #[test]
    fn alternate_removals_with_identity_hash() {
        let mut set: MergeSet<u64, HashTraits<IdentityBuild>> = MergeSet::new();
        for k in 0..40u64 {
            set.insert(k * 3).unwrap();
        }
        for k in (0..40u64).step_by(2) {
            assert_eq!(set.remove(&(k * 3)), Ok(Some(k * 3)));
        }
        for k in 0..40u64 {
            assert_eq!(set.contains(&(k * 3)), k % 2 == 1, "key {}", k * 3);
        }
        assert_eq!(set.len(), 20);
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Collide(u32);
    impl Hash for Collide {
        fn hash<H: Hasher>(&self, state: &mut H) {
            state.write_u64(u64::from(self.0 % 4));
        }
    }

    #[test]
    fn equal_hash_runs_are_searched_fully() {
        let mut set: MergeSet<Collide, HashTraits<IdentityBuild>> = MergeSet::new();
        for k in 0..100 {
            set.insert(Collide(k)).unwrap();
        }
        for k in 0..100 {
            assert!(set.contains(&Collide(k)));
        }
        assert!(!set.contains(&Collide(100)));
        assert_eq!(set.remove_if(|c| c.0 % 3 == 0), Ok(34));
        for k in 0..100 {
            assert_eq!(set.contains(&Collide(k)), k % 3 != 0);
        }
    }

    #[test]
    fn positions_are_invalidated_by_mutation() {
        let mut set: MergeSet<u64> = MergeSet::new();
        let missing = set.find(&5);
        assert!(!missing.is_found());
        let pos = set.add(missing, || 5).unwrap();
        assert_eq!(set.at(pos), Ok(&5));
        #[cfg(feature = "checked")]
        {
            assert_eq!(set.add(missing, || 5), Err(Error::InvalidatedPosition));
            assert_eq!(set.add(pos, || 5), Err(Error::PositionOccupied));
            set.insert(6).unwrap();
            assert_eq!(set.at(pos), Err(Error::InvalidatedPosition));
        }
        let pos = set.find(&5);
        assert_eq!(set.extract(pos), Ok(5));
        assert_eq!(set.at(set.find(&5)), Err(Error::EmptyPosition));
    }

    /// Invariant: `find` twice in a row returns the same position and does
    /// not change the count.
    #[test]
    fn find_is_idempotent() {
        let set: MergeSet<u64> = shuffled(500, 2).into_iter().collect();
        for k in [0u64, 17, 499, 1000] {
            let a = set.find(&k);
            let b = set.find(&k);
            assert_eq!(a, b);
            assert_eq!(set.len(), 500);
        }
    }

    struct Tracked(u64, Rc<Cell<usize>>);
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.set(self.1.get() + 1);
        }
    }
    impl PartialEq for Tracked {
        fn eq(&self, other: &Self) -> bool {
            self.0 == other.0
        }
    }
    impl Eq for Tracked {}
    impl Hash for Tracked {
        fn hash<H: Hasher>(&self, state: &mut H) {
            self.0.hash(state);
        }
    }

    /// A panicking creator on the merge path leaves the set unchanged and
    /// drops nothing.
    #[test]
    fn panicking_creator_during_merge_is_rolled_back() {
        let drops = Rc::new(Cell::new(0));
        let mut set: MergeSet<Tracked> = MergeSet::new();
        for k in 0..8 {
            set.insert(Tracked(k, drops.clone())).unwrap();
        }
        let probe = Tracked(100, drops.clone());
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = set.insert_with(&probe, || panic!("creator failed"));
        }));
        assert!(res.is_err());
        assert_eq!(drops.get(), 0);
        assert_eq!(set.len(), 8);
        assert_eq!(set.segment_count(), 1);
        for k in 0..8 {
            assert!(set.contains(&Tracked(k, drops.clone())));
        }
        drop(probe);
        drop(set);
        // 8 items, the probe and 8 lookup temporaries
        assert_eq!(drops.get(), 17);
    }

    thread_local! {
        static EXPLODE: Cell<bool> = const { Cell::new(false) };
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Fragile(u32);
    impl Hash for Fragile {
        fn hash<H: Hasher>(&self, state: &mut H) {
            if EXPLODE.with(Cell::get) && self.0 < 8 {
                panic!("hash failed");
            }
            self.0.hash(state);
        }
    }

    /// A hash that panics while a merge orders segment 0 leaves every item
    /// where it was; only the new item is lost.
    #[test]
    fn panicking_hash_during_merge_is_rolled_back() {
        let mut set: MergeSet<Fragile> = MergeSet::new();
        for k in 0..8 {
            set.insert(Fragile(k)).unwrap();
        }
        let pos = set.find(&Fragile(50));
        EXPLODE.with(|e| e.set(true));
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = set.add(pos, || Fragile(50));
        }));
        EXPLODE.with(|e| e.set(false));
        assert!(res.is_err());
        assert_eq!(set.len(), 8);
        assert!(!set.contains(&Fragile(50)));
        for k in 0..8 {
            assert!(set.contains(&Fragile(k)));
        }
        set.insert(Fragile(50)).unwrap();
        assert_eq!(set.len(), 9);
    }

    #[test]
    fn less_mode_keeps_sorted_segments() {
        let mut set: MergeSet<u64, LessTraits> = MergeSet::new();
        for k in shuffled(1024, 3) {
            assert!(set.insert(k).unwrap().inserted);
        }
        for seg in set.stack.segments.iter().skip(1) {
            assert!(seg.as_slice().windows(2).all(|w| w[0] < w[1]));
        }
        for k in 0..1024 {
            assert!(set.contains(&k));
        }
        assert!(!set.contains(&1024));
        assert!(matches!(set.remove(&3), Err(Error::Unsupported(_))));
        assert!(matches!(set.remove_if(|_| true), Err(Error::Unsupported(_))));
        assert_eq!(set.len(), 1024);
    }

    #[test]
    fn nothrow_less_mode_with_bloom() {
        let mut set: MergeSet<u64, NothrowLessTraits<Bloom>> = MergeSet::new();
        for k in shuffled(700, 4) {
            set.insert(k * 2).unwrap();
        }
        for k in 0..1400 {
            assert_eq!(set.contains(&k), k % 2 == 0);
        }
    }

    #[test]
    fn hash_mode_with_bloom_has_no_false_negatives() {
        type Filtered = HashTraits<hashbrown::hash_map::DefaultHashBuilder, Bloom>;
        let mut set: MergeSet<u64, Filtered> = MergeSet::new();
        for k in shuffled(2000, 5) {
            set.insert(k).unwrap();
        }
        for k in (0..2000).step_by(3) {
            set.remove(&k).unwrap();
        }
        for k in 0..2000 {
            assert_eq!(set.contains(&k), k % 3 != 0);
        }
    }

    /// Invariant: merging disjoint sets yields the union and empties the
    /// source; shared keys stay in the source.
    #[test]
    fn merge_from_moves_absent_keys() {
        let mut a: MergeSet<u64> = (0..300).collect();
        let mut b: MergeSet<u64> = (250..600).collect();
        a.merge_from(&mut b).unwrap();
        assert_eq!(a.len(), 600);
        assert_eq!(b.len(), 50);
        assert!((250..300).all(|k| b.contains(&k)));
        let mut c: MergeSet<u64> = (600..700).collect();
        c.merge_to(&mut a).unwrap();
        assert!(c.is_empty());
        assert_eq!(a.len(), 700);
        assert!((0..700).all(|k| a.contains(&k)));
    }

    #[test]
    fn merge_from_in_less_mode() {
        let mut a: MergeSet<u64, LessTraits> = (0..100).collect();
        let mut b: MergeSet<u64, LessTraits> = (90..200).collect();
        a.merge_from(&mut b).unwrap();
        assert_eq!(a.len(), 200);
        for seg in b.segments() {
            assert_eq!(seg.filled(), seg.live());
        }
        for k in 90..100 {
            assert!(b.contains(&k));
        }
        assert!(!b.contains(&150));
        let mut rest: Vec<u64> = b.into_iter().collect();
        rest.sort_unstable();
        assert_eq!(rest, (90..100).collect::<Vec<_>>());
    }

    thread_local! {
        static FUSE: Cell<usize> = const { Cell::new(usize::MAX) };
    }

    /// Key whose comparison panics once `FUSE` runs out.
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Fused(u32);
    impl Ord for Fused {
        fn cmp(&self, other: &Self) -> core::cmp::Ordering {
            let left = FUSE.with(Cell::get);
            if left == 0 {
                panic!("comparison failed");
            }
            FUSE.with(|f| f.set(left - 1));
            self.0.cmp(&other.0)
        }
    }
    impl PartialOrd for Fused {
        fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    /// Invariant: a merge interrupted partway leaves each item in one of the
    /// two sets (the one in flight aside), and both stay searchable.
    #[test]
    fn interrupted_less_merge_keeps_both_sides_usable() {
        let mut a: MergeSet<Fused, LessTraits> = (0..50).map(Fused).collect();
        let mut b: MergeSet<Fused, LessTraits> = (40..120).map(Fused).collect();
        FUSE.with(|f| f.set(300));
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = a.merge_from(&mut b);
        }));
        FUSE.with(|f| f.set(usize::MAX));
        assert!(res.is_err());
        let total = a.len() + b.len();
        assert!(total == 129 || total == 130, "total {total}");
        for seg in b.segments() {
            assert_eq!(seg.filled(), seg.live());
        }
        assert_eq!(a.iter().count(), a.len());
        assert_eq!(b.iter().count(), b.len());
        for item in b.iter() {
            assert!(b.contains(item));
        }
        for item in a.iter() {
            assert!(a.contains(item));
        }
        for k in 0..50 {
            assert!(a.contains(&Fused(k)));
        }
        let before = a.len();
        a.merge_from(&mut b).unwrap();
        assert!(a.len() > before);
        assert!(b.iter().all(|item| (40..50).contains(&item.0)));
        assert_eq!(a.len() + b.len(), total);
    }

    #[test]
    fn clone_clear_and_owning_iteration() {
        let mut set: MergeSet<String> = (0..50).map(|k| k.to_string()).collect();
        set.remove(&"7".to_string()).unwrap();
        let copy = set.clone();
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.iter().next(), None);
        assert_eq!(copy.len(), 49);
        assert!(copy.contains(&"8".to_string()));
        assert!(!copy.contains(&"7".to_string()));
        let mut all: Vec<String> = copy.into_iter().collect();
        all.sort_by_key(|s| s.parse::<u32>().unwrap_or(0));
        assert_eq!(all.len(), 49);
        assert_eq!(all[0], "0");
    }

    #[test]
    fn insert_many_counts_new_items() {
        let mut set: MergeSet<u64> = MergeSet::new();
        assert_eq!(set.insert_many([1, 2, 3, 2, 1]), Ok(3));
        assert_eq!(set.insert_many(0..10), Ok(7));
        assert_eq!(set.len(), 10);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "reentrancy detected")]
    fn reentrant_lookup_from_hash_panics() {
        thread_local! {
            static SET: Cell<*const MergeSet<Reenter>> = const { Cell::new(core::ptr::null()) };
        }
        #[derive(PartialEq, Eq)]
        struct Reenter(u32);
        impl Hash for Reenter {
            fn hash<H: Hasher>(&self, state: &mut H) {
                let ptr = SET.with(Cell::get);
                if !ptr.is_null() {
                    unsafe { (*ptr).contains(&Reenter(0)) };
                }
                self.0.hash(state);
            }
        }
        let set: MergeSet<Reenter> = MergeSet::new();
        SET.with(|s| s.set(&set));
        set.contains(&Reenter(1));
    }
}
