use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use mergeset::bucket::Bucket;
use mergeset::pool::BucketPools;
use mergeset::BucketHashSet;
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
    c.bench_function("bucket_set::insert_fresh_100k", |b| {
        b.iter_batched(
            BucketHashSet::<String>::new,
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

fn bench_find_hit_10k(c: &mut Criterion) {
    let keys: Vec<String> = lcg(7).take(100_000).map(key).collect();
    let mut set: BucketHashSet<String> = BucketHashSet::new();
    for k in &keys {
        let _ = set.insert(k.clone()).unwrap();
    }
    c.bench_function("bucket_set::find_hit_10k", |b| {
        b.iter(|| {
            for k in keys.iter().take(10_000) {
                black_box(set.contains(k));
            }
        })
    });
}

// Fill and drain one cluster repeatedly; blocks come from the pool cache.
fn bench_cluster_churn(c: &mut Criterion) {
    c.bench_function("bucket::fill_clear_1000", |b| {
        b.iter_batched(
            BucketPools::<u64, 4>::new,
            |mut pools| {
                let mut bucket: Bucket<u64, 4> = Bucket::new();
                for (i, x) in lcg(3).take(1_000).enumerate() {
                    let _ = bucket.add(&mut pools, || x, x, 8, 0);
                    if i % 4 == 3 {
                        bucket.clear(&mut pools);
                    }
                }
                bucket.clear(&mut pools);
                black_box(pools)
            },
            BatchSize::SmallInput,
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
    name = benches;
    config = bench_config();
    targets = bench_insert_fresh_100k, bench_find_hit_10k, bench_cluster_churn
}
criterion_main!(benches);
