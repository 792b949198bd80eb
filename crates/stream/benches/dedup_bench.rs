//! Dedup cache benchmarks
//!
//! Measures check-and-record cost under the two mesh traffic shapes that
//! matter: mostly-new fingerprints, and relay floods of the same reading.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use meshward_core::DedupFingerprint;
use meshward_stream::{DedupConfig, DeduplicationCache};
use std::time::Duration;

fn fingerprints(n: usize) -> Vec<DedupFingerprint> {
    (0..n)
        .map(|i| DedupFingerprint::new(&format!("device-{}", i % 500), "temperature", &i.to_string()))
        .collect()
}

fn bench_unique_readings(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_unique");
    for max_entries in [1_000usize, 100_000] {
        let fps = fingerprints(10_000);
        group.bench_with_input(BenchmarkId::from_parameter(max_entries), &fps, |b, fps| {
            b.iter(|| {
                let cache = DeduplicationCache::new(DedupConfig {
                    horizon: Duration::from_secs(3600),
                    max_entries,
                });
                for fp in fps {
                    black_box(cache.check_and_record(fp));
                }
            })
        });
    }
    group.finish();
}

fn bench_flooded_reading(c: &mut Criterion) {
    let cache = DeduplicationCache::default();
    let fp = DedupFingerprint::new("device-1", "temperature", "1700000000");
    cache.check_and_record(&fp);

    c.bench_function("dedup_flooded_duplicate", |b| {
        b.iter(|| black_box(cache.check_and_record(black_box(&fp))))
    });
}

criterion_group!(benches, bench_unique_readings, bench_flooded_reading);
criterion_main!(benches);
