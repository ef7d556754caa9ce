//! Controller and metrics hot-path benchmark
//!
//! The control loop runs `observe` + `adjust` once per tick and every worker
//! calls `record_duration` once per job; these must stay cheap relative to the
//! work they govern.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use adaptive_pool::worker::{AdmissionState, ConcurrencyController};
use adaptive_pool::MetricsCollector;

/// Benchmark one controller step over a noisy CPU signal
fn bench_controller_tick(c: &mut Criterion) {
    let readings: Vec<f64> = (0..256)
        .map(|i| ((i * 37) % 100) as f64)
        .collect();
    let durations: Vec<Option<Duration>> = (0..256u64)
        .map(|i| Some(Duration::from_micros(500 + (i * 113) % 200_000)))
        .collect();

    let mut group = c.benchmark_group("controller/tick");
    group.throughput(Throughput::Elements(1));

    for max_parallelism in [4usize, 64] {
        group.bench_with_input(
            BenchmarkId::new("max_parallelism", max_parallelism),
            &max_parallelism,
            |b, &max_parallelism| {
                let mut controller = ConcurrencyController::new(max_parallelism, 75.0, true);
                let mut i = 0usize;
                b.iter(|| {
                    let idx = i % readings.len();
                    controller.observe(Some(readings[idx]));
                    let adjustment = controller.adjust(durations[idx]);
                    i = i.wrapping_add(1);
                    black_box(adjustment)
                });
            },
        );
    }

    group.finish();
}

/// Benchmark admission checks as producers would call them
fn bench_admission_check(c: &mut Criterion) {
    let state = AdmissionState::new(80.0, true, 2, 8);
    state.set_smoothed_cpu(42.0);

    c.bench_function("admission/check", |b| {
        let mut queue_len = 0usize;
        b.iter(|| {
            queue_len = (queue_len + 1) % 32;
            black_box(state.check(black_box(queue_len)))
        });
    });
}

/// Benchmark duration recording, single-threaded and contended
fn bench_record_duration(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics/record_duration");
    group.throughput(Throughput::Elements(1));

    for window in [100usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("window", window), &window, |b, &window| {
            let metrics = MetricsCollector::new(window);
            let mut micros = 0u64;
            b.iter(|| {
                micros = (micros + 17) % 100_000;
                metrics.record_duration(Duration::from_micros(micros));
            });
        });
    }

    group.bench_function("contended/4_threads", |b| {
        b.iter_custom(|iters| {
            let metrics = Arc::new(MetricsCollector::new(100));
            let start = std::time::Instant::now();
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let metrics = metrics.clone();
                    std::thread::spawn(move || {
                        for n in 0..iters {
                            metrics.record_duration(Duration::from_micros(n % 5_000));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            start.elapsed() / 4
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_controller_tick,
    bench_admission_check,
    bench_record_duration
);
criterion_main!(benches);
