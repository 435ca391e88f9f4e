#![cfg(test)]

// Property tests for MergeSet kept inside the crate so they can inspect the
// segment stack directly.

use crate::bloom::Bloom;
use crate::merge_set::MergeSet;
use crate::traits::{HashTraits, LessTraits, MergeTraits};
use hashbrown::hash_map::DefaultHashBuilder;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::hash::{BuildHasher, Hasher};

// Pool-indexed operations so shrinking moves toward earlier keys and
// shorter op lists.
#[derive(Clone, Debug)]
enum Op {
    Insert(usize),
    InsertWith(usize),
    Add(usize),
    Remove(usize),
    Find(usize),
    RemoveIfMod(u8),
    Iterate,
}

fn arb_ops() -> impl Strategy<Value = (Vec<u32>, Vec<Op>)> {
    proptest::collection::vec(0u32..5_000, 1..=64).prop_flat_map(|pool| {
        let idx = 0..pool.len();
        let op = prop_oneof![
            4 => idx.clone().prop_map(Op::Insert),
            2 => idx.clone().prop_map(Op::InsertWith),
            2 => idx.clone().prop_map(Op::Add),
            3 => idx.clone().prop_map(Op::Remove),
            2 => idx.clone().prop_map(Op::Find),
            1 => (2u8..7).prop_map(Op::RemoveIfMod),
            1 => Just(Op::Iterate),
        ];
        proptest::collection::vec(op, 1..200).prop_map(move |ops| (pool.clone(), ops))
    })
}

fn check_segments<Tr: MergeTraits<u32>>(set: &MergeSet<u32, Tr>) -> Result<(), TestCaseError> {
    let mut total = 0;
    for (i, seg) in set.segments().iter().enumerate() {
        prop_assert!(seg.live() <= seg.filled());
        prop_assert!(seg.filled() <= seg.capacity());
        if seg.is_allocated() {
            prop_assert_eq!(seg.capacity(), Tr::segment_item_count(i));
        }
        total += seg.live();
    }
    prop_assert_eq!(total, set.len());
    Ok(())
}

fn run_model<Tr>(pool: &[u32], ops: &[Op]) -> Result<(), TestCaseError>
where
    Tr: MergeTraits<u32> + Default,
{
    let removable = Tr::MODE.is_hash();
    let mut sut: MergeSet<u32, Tr> = MergeSet::new();
    let mut model: BTreeSet<u32> = BTreeSet::new();
    for op in ops {
        match *op {
            Op::Insert(i) => {
                let k = pool[i];
                let res = sut.insert(k).unwrap();
                prop_assert_eq!(res.inserted, model.insert(k));
                prop_assert_eq!(sut.at(res.position), Ok(&k));
            }
            Op::InsertWith(i) => {
                let k = pool[i];
                let mut calls = 0;
                let res = sut
                    .insert_with(&k, || {
                        calls += 1;
                        k
                    })
                    .unwrap();
                let fresh = model.insert(k);
                prop_assert_eq!(res.inserted, fresh);
                prop_assert_eq!(calls, usize::from(fresh));
            }
            Op::Add(i) => {
                let k = pool[i];
                let pos = sut.find(&k);
                prop_assert_eq!(pos.is_found(), model.contains(&k));
                if !pos.is_found() {
                    let pos = sut.add(pos, || k).unwrap();
                    prop_assert_eq!(sut.at(pos), Ok(&k));
                    model.insert(k);
                }
            }
            Op::Remove(i) if removable => {
                let k = pool[i];
                let removed = sut.remove(&k).unwrap();
                prop_assert_eq!(removed.is_some(), model.remove(&k));
                prop_assert!(!sut.contains(&k));
            }
            Op::RemoveIfMod(m) if removable => {
                let m = u32::from(m);
                let removed = sut.remove_if(|k| k % m == 0).unwrap();
                let before = model.len();
                model.retain(|k| k % m != 0);
                prop_assert_eq!(removed, before - model.len());
            }
            Op::Remove(_) | Op::RemoveIfMod(_) => {
                prop_assert!(sut.remove(&pool[0]).is_err());
            }
            Op::Find(i) => {
                let k = pool[i];
                let a = sut.find(&k);
                let b = sut.find(&k);
                prop_assert_eq!(a, b);
                prop_assert_eq!(a.is_found(), model.contains(&k));
            }
            Op::Iterate => {
                let seen: BTreeSet<u32> = sut.iter().copied().collect();
                prop_assert_eq!(&seen, &model);
                prop_assert_eq!(sut.iter().len(), model.len());
            }
        }
        check_segments(&sut)?;
        prop_assert_eq!(sut.len(), model.len());
    }
    for k in pool {
        prop_assert_eq!(sut.contains(k), model.contains(k));
    }
    Ok(())
}

// Constant hasher: every key collides, so lookups rely on equality scans.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

// Property: state-machine equivalence against BTreeSet.
// Invariants exercised across random operation sequences:
// - `insert`/`insert_with`/`add` add exactly the keys the model lacks; the
//   creator of `insert_with` runs only when the key is new.
// - `find` is idempotent and agrees with the model.
// - removals (hash mode) drop exactly the model's keys; ordered modes
//   reject them.
// - per segment: live <= filled <= capacity, capacities follow the schedule,
//   and live counts sum to `len`.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_hash_mode((pool, ops) in arb_ops()) {
        run_model::<HashTraits>(&pool, &ops)?;
    }

    #[test]
    fn prop_hash_mode_with_bloom((pool, ops) in arb_ops()) {
        run_model::<HashTraits<DefaultHashBuilder, Bloom>>(&pool, &ops)?;
    }

    #[test]
    fn prop_hash_mode_all_colliding((pool, ops) in arb_ops()) {
        run_model::<HashTraits<ConstBuildHasher>>(&pool, &ops)?;
    }

    #[test]
    fn prop_less_mode((pool, ops) in arb_ops()) {
        run_model::<LessTraits>(&pool, &ops)?;
    }

    #[test]
    fn prop_less_mode_small_segments((pool, ops) in arb_ops()) {
        run_model::<LessTraits<Bloom, DefaultHashBuilder, 1, true>>(&pool, &ops)?;
    }

    // Property: after inserting then removing, the set equals the net
    // survivors regardless of order.
    #[test]
    fn prop_round_trip(
        keys in proptest::collection::vec(0u32..2_000, 0..400),
        seed in any::<u64>(),
    ) {
        let mut sut: MergeSet<u32> = MergeSet::new();
        for &k in &keys {
            sut.insert(k).unwrap();
        }
        let unique: BTreeSet<u32> = keys.iter().copied().collect();
        let doomed: BTreeSet<u32> = unique
            .iter()
            .copied()
            .filter(|k| (u64::from(*k) ^ seed) % 3 == 0)
            .collect();
        for k in &doomed {
            prop_assert_eq!(sut.remove(k).unwrap(), Some(*k));
        }
        let rest: BTreeSet<u32> = sut.iter().copied().collect();
        let expected: BTreeSet<u32> = unique.difference(&doomed).copied().collect();
        prop_assert_eq!(rest, expected);
    }

    // Property: merging disjoint sets yields the union and leaves the source
    // empty, in both ordering modes.
    #[test]
    fn prop_merge_disjoint(a in proptest::collection::btree_set(0u32..10_000, 0..300),
                           b in proptest::collection::btree_set(10_000u32..20_000, 0..300)) {
        let mut ha: MergeSet<u32> = a.iter().copied().collect();
        let mut hb: MergeSet<u32> = b.iter().copied().collect();
        ha.merge_from(&mut hb).unwrap();
        prop_assert!(hb.is_empty());
        let got: BTreeSet<u32> = ha.iter().copied().collect();
        let union: BTreeSet<u32> = a.union(&b).copied().collect();
        prop_assert_eq!(&got, &union);

        let mut la: MergeSet<u32, LessTraits> = a.iter().copied().collect();
        let mut lb: MergeSet<u32, LessTraits> = b.iter().copied().collect();
        la.merge_from(&mut lb).unwrap();
        prop_assert!(lb.is_empty());
        prop_assert_eq!(la.len(), union.len());
        for k in &union {
            prop_assert!(la.contains(k));
        }
    }
}
