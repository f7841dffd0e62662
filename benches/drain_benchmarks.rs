use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use fluxweld::core::{BoundedQueue, Demand, HandoffQueue, LinkedQueue};
use fluxweld::prelude::*;

fn bench_sync_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_chain");

    for size in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("map_filter", size), size, |b, &size| {
            b.iter(|| {
                let ts = TestSubscriber::<i64>::new();
                Flowable::range(0, size)
                    .map(|x| black_box(x * 3))
                    .filter(|x| x % 2 == 0)
                    .subscribe(ts.clone());
                black_box(ts.value_count());
            });
        });

        group.bench_with_input(BenchmarkId::new("fused_map", size), size, |b, &size| {
            b.iter(|| {
                let ts = TestSubscriber::<i64>::with_fusion(FusionMode::SYNC, 0);
                Flowable::range(0, size)
                    .map(|x| black_box(x + 1))
                    .subscribe(ts.clone());
                black_box(ts.value_count());
            });
        });

        group.bench_with_input(BenchmarkId::new("batched_demand", size), size, |b, &size| {
            b.iter(|| {
                let ts = TestSubscriber::<i64>::with_request(16);
                Flowable::range(0, size).subscribe(ts.clone());
                while !ts.is_terminated() {
                    ts.request(16);
                }
            });
        });
    }

    group.finish();
}

fn bench_primitives(c: &mut Criterion) {
    let mut group = c.benchmark_group("primitives");

    group.bench_function("demand_add_produced", |b| {
        let demand = Demand::new();
        b.iter(|| {
            demand.add(black_box(4));
            black_box(demand.produced(4));
        });
    });

    group.bench_function("bounded_queue_roundtrip", |b| {
        let queue = BoundedQueue::new(128);
        b.iter(|| {
            let _ = queue.offer(black_box(1u64));
            black_box(queue.poll());
        });
    });

    group.bench_function("linked_queue_roundtrip", |b| {
        let queue = LinkedQueue::new();
        b.iter(|| {
            let _ = queue.offer(black_box(1u64));
            black_box(queue.poll());
        });
    });

    group.finish();
}

fn bench_async_boundaries(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_boundaries");
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();

    for rails in [2usize, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("parallel_reduce", rails),
            rails,
            |b, &rails| {
                b.iter(|| {
                    runtime.block_on(async {
                        let scheduler: Arc<dyn Scheduler> =
                            Arc::new(TokioScheduler::current());
                        let flows = (0..rails as i64)
                            .map(|i| Flowable::range(i * 1000, 1000).observe_on(scheduler.clone()))
                            .collect();
                        let ts = TestSubscriber::<i64>::new();
                        ParallelFlowable::from_rails(flows)
                            .reduce(|a, b| a + b)
                            .subscribe(ts.clone());
                        ts.await_terminal(Duration::from_secs(10)).await;
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sync_chain,
    bench_primitives,
    bench_async_boundaries
);
criterion_main!(benches);
