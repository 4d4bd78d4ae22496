//! Index file benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kcache_storage::{IndexCursor, IndexFile, SortOrder, SortSpace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Builds a frozen, sorted index of `count` random keys.
fn sorted_index(dir: &TempDir, count: u32) -> IndexFile {
    let mut rng = StdRng::seed_from_u64(11);
    let scan = IndexFile::create(&dir.path().join("bench.scan"), count * 8, SortOrder::ByValue).unwrap();
    for position in 0..count {
        scan.append_entry(rng.gen(), position);
    }
    let mut space = SortSpace::new(count as usize);
    scan.sort_by_key(
        &dir.path().join("bench.index.sorting"),
        &dir.path().join("bench.index"),
        &mut space,
    )
    .unwrap()
}

/// Benchmark binary-search lookups on sorted indexes.
fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_lookup");

    for count in [1_000u32, 100_000].iter() {
        let dir = TempDir::new().unwrap();
        let index = sorted_index(&dir, *count);
        let keys: Vec<u32> = index.to_vec().iter().map(|e| (e >> 32) as u32).collect();

        group.bench_with_input(BenchmarkId::new("first", count), count, |b, _| {
            let mut i = 0;
            b.iter(|| {
                let key = keys[(i * 7) % keys.len()];
                i += 1;
                black_box(index.first(black_box(key)))
            });
        });

        group.bench_with_input(BenchmarkId::new("ceiling", count), count, |b, _| {
            let mut i = 0;
            b.iter(|| {
                let key = keys[(i * 13) % keys.len()];
                i += 1;
                black_box(index.ceiling(black_box(key), IndexCursor::new(0, 0)))
            });
        });
    }

    group.finish();
}

/// Benchmark the freeze-time sort.
fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_sort");
    group.sample_size(20);

    group.bench_function("sort_100k", |b| {
        b.iter(|| {
            let dir = TempDir::new().unwrap();
            black_box(sorted_index(&dir, 100_000).entries())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_lookup, bench_sort);

criterion_main!(benches);
