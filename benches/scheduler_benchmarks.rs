//! Performance benchmarks for the scheduler hot paths
//!
//! Targets:
//! - Fusion of one candidate: <50µs for 1000 observations
//! - Bandit weights: <100µs for 100 categories
//! - Queue push/pop: <1µs per operation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use evolver_core::bandit::{clamp_weights, softmax, BanditScheduler, TrialOutcome};
use evolver_core::config::{BanditConfig, FusionConfig};
use evolver_core::fitness::fuse_observations;
use evolver_core::ledger::{ProductionObservation, SyntheticObservation};
use evolver_core::tournament::queue::{DedupQueue, OverflowPolicy, QueueKey};
use std::time::Duration;

const NOW: f64 = 1_700_000_000.0;

fn observations(n: usize) -> (Vec<ProductionObservation>, Vec<SyntheticObservation>) {
    let production = (0..n)
        .map(|i| ProductionObservation {
            candidate_id: "c".to_string(),
            ok: i % 7 != 0,
            ttr_ms: (i % 900) as f64,
            ts: NOW - i as f64,
        })
        .collect();
    let synthetic = (0..n)
        .map(|i| SyntheticObservation {
            candidate: "c".to_string(),
            composite_phase_fitness: (i % 100) as f64 / 100.0,
            ts: NOW - (i * 60) as f64,
        })
        .collect();
    (production, synthetic)
}

/// Benchmark 1: Fitness fusion
fn bench_fusion(c: &mut Criterion) {
    let mut group = c.benchmark_group("fitness_fusion");
    let config = FusionConfig::default();

    for n in [10usize, 100, 1000] {
        let (production, synthetic) = observations(n);
        group.throughput(Throughput::Elements((2 * n) as u64));
        group.bench_with_input(BenchmarkId::new("fuse", n), &n, |b, _| {
            b.iter(|| fuse_observations(black_box(&config), black_box(&production), black_box(&synthetic), NOW));
        });
    }

    group.finish();
}

/// Benchmark 2: Bandit weighting
fn bench_bandit(c: &mut Criterion) {
    let mut group = c.benchmark_group("bandit_weights");

    for categories in [5usize, 20, 100] {
        let mut bandit = BanditScheduler::new(BanditConfig::default());
        for i in 0..categories {
            let name = format!("chamber-{}", i);
            for t in 0..(i % 9 + 1) {
                let outcome = if t % 3 == 0 {
                    TrialOutcome::failed(Duration::from_secs(30), format!("sig-{}", t))
                } else {
                    TrialOutcome::passed(Duration::from_secs(45))
                };
                bandit.record_trial(&name, &outcome);
            }
        }
        group.bench_with_input(BenchmarkId::new("compute_weights", categories), &categories, |b, _| {
            b.iter(|| black_box(&bandit).compute_weights());
        });

        let raw = softmax(&(0..categories).map(|i| i as f64 * 0.1).collect::<Vec<_>>());
        group.bench_with_input(BenchmarkId::new("clamp_weights", categories), &categories, |b, _| {
            b.iter(|| clamp_weights(black_box(&raw), 0.01, 0.5));
        });
    }

    group.finish();
}

struct Item(String);

impl QueueKey for Item {
    fn queue_key(&self) -> &str {
        &self.0
    }
}

/// Benchmark 3: Deferred queue
fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("deferred_queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_evict_pop", |b| {
        let mut queue = DedupQueue::new(100, OverflowPolicy::EvictOldest);
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(queue.push(Item(format!("q{}", i))));
            if i % 3 == 0 {
                black_box(queue.pop());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fusion, bench_bandit, bench_queue);
criterion_main!(benches);
