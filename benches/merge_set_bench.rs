use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use mergeset::{hash_sorter, LessTraits, MergeMap, MergeSet, NothrowLessTraits};
use std::hash::BuildHasher;
use std::time::Duration;

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

fn key(n: u64) -> String {
    format!("k{:016x}", n)
}

fn bench_insert_fresh_100k(c: &mut Criterion) {
    c.bench_function("merge_set::insert_fresh_100k", |b| {
        b.iter_batched(
            MergeSet::<String>::new,
            |mut s| {
                for x in lcg(1).take(100_000) {
                    let _ = s.insert(key(x)).unwrap();
                }
                black_box(s)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_insert_ordered_100k(c: &mut Criterion) {
    c.bench_function("merge_set::insert_ordered_100k", |b| {
        b.iter_batched(
            MergeSet::<u64, LessTraits>::new,
            |mut s| {
                for x in lcg(2).take(100_000) {
                    let _ = s.insert(x).unwrap();
                }
                black_box(s)
            },
            BatchSize::SmallInput,
        )
    });
    c.bench_function("merge_set::insert_ordered_nothrow_100k", |b| {
        b.iter_batched(
            MergeSet::<u64, NothrowLessTraits>::new,
            |mut s| {
                for x in lcg(2).take(100_000) {
                    let _ = s.insert(x).unwrap();
                }
                black_box(s)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_find_hit_miss(c: &mut Criterion) {
    let keys: Vec<String> = lcg(7).take(100_000).map(key).collect();
    let map: MergeMap<String, u64> = keys.iter().cloned().zip(0..).collect();
    let misses: Vec<String> = lcg(8).take(10_000).map(key).collect();
    c.bench_function("merge_map::find_hit_10k", |b| {
        b.iter(|| {
            for k in keys.iter().take(10_000) {
                black_box(map.get(k));
            }
        })
    });
    c.bench_function("merge_map::find_miss_10k", |b| {
        b.iter(|| {
            for k in &misses {
                black_box(map.get(k));
            }
        })
    });
}

fn bench_remove_half(c: &mut Criterion) {
    c.bench_function("merge_set::remove_half_of_100k", |b| {
        b.iter_batched(
            || {
                let keys: Vec<u64> = lcg(5).take(100_000).collect();
                let set: MergeSet<u64> = keys.iter().copied().collect();
                (set, keys)
            },
            |(mut set, keys)| {
                for k in keys.iter().step_by(2) {
                    let _ = set.remove(k);
                }
                black_box(set)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_hash_sort(c: &mut Criterion) {
    let hasher = hashbrown::hash_map::DefaultHashBuilder::default();
    c.bench_function("hash_sorter::sort_100k", |b| {
        b.iter_batched(
            || lcg(11).take(100_000).collect::<Vec<u64>>(),
            |mut items| {
                hash_sorter::sort(&mut items, |x| hasher.hash_one(x), |a, b| a == b);
                black_box(items)
            },
            BatchSize::LargeInput,
        )
    });
    c.bench_function("hash_sorter::sort_hashed_100k", |b| {
        b.iter_batched(
            || lcg(12).take(100_000).map(key).collect::<Vec<String>>(),
            |mut items| {
                let hashes =
                    hash_sorter::sort_hashed(&mut items, |x| hasher.hash_one(x), |a, b| a == b)
                        .unwrap();
                black_box((items, hashes))
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(12)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1))
}

criterion_group! {
    name = benches_insert;
    config = bench_config();
    targets = bench_insert_fresh_100k, bench_insert_ordered_100k
}
criterion_group! {
    name = benches_ops;
    config = bench_config();
    targets = bench_find_hit_miss,
              bench_remove_half,
              bench_hash_sort
}
criterion_main!(benches_insert, benches_ops);
