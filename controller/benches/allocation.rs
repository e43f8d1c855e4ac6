//! Micro-benchmarks for rotation planning
//!
//! - Throughput allocation across fleets of various sizes
//! - Weighted worker selection
//!
//! Run with: cargo bench --bench allocation

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tidepool_controller::fleet::random::weighted_selection;
use tidepool_controller::fleet::{Bounds, allocate};

fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate");
    let bounds = Bounds::new(400.0, 1200.0);

    for count in [4usize, 16, 64] {
        let target = count as f64 * 800.0;
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut rng = StdRng::seed_from_u64(7);
            b.iter(|| allocate(black_box(target), count, bounds, 0.25, &mut rng));
        });
    }
    group.finish();
}

fn bench_weighted_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("weighted_selection");

    for pool in [10usize, 100, 1000] {
        let weights: Vec<f64> = (0..pool).map(|i| 0.5 + (i % 7) as f64 * 0.25).collect();
        group.bench_with_input(BenchmarkId::from_parameter(pool), &weights, |b, weights| {
            let mut rng = StdRng::seed_from_u64(7);
            b.iter(|| weighted_selection(black_box(8), weights, &mut rng));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_allocate, bench_weighted_selection);
criterion_main!(benches);
