// Criterion benchmarks for the admission hot paths
//
// Run benchmarks with:
//   cargo bench -p bulwark_runtime

use bulwark_core::{ManualClock, Priority, RequestId, ThrottleConfig};
use bulwark_runtime::{PriorityScheduler, Throttler};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

fn bench_should_throttle(c: &mut Criterion) {
    let mut group = c.benchmark_group("should_throttle");

    for priority in [Priority::Critical, Priority::Medium] {
        let clock = ManualClock::new();
        let throttler = Throttler::new(
            ThrottleConfig {
                max_burst: u32::MAX,
                rate_per_second: 1_000_000.0,
                window_max_requests: u32::MAX,
                ..ThrottleConfig::default()
            },
            Arc::new(clock.clone()),
        );
        let id = RequestId::new();
        group.bench_with_input(
            BenchmarkId::from_parameter(priority),
            &priority,
            |b, priority| {
                b.iter(|| {
                    clock.advance(Duration::from_millis(1));
                    throttler.should_throttle(black_box(id), *priority, black_box("orders"))
                });
            },
        );
    }

    group.finish();
}

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");
    let scheduler = PriorityScheduler::new(6, Arc::new(ManualClock::new()));

    group.bench_function("acquire_release_uncontended", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let slot = scheduler.acquire(black_box(Priority::High)).await;
                drop(slot);
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_should_throttle, bench_acquire_release);
criterion_main!(benches);
