use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use call_dispatch::{Config, Dispatcher, WorkUnit};
use std::{
    convert::Infallible,
    hint::black_box,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::time::Duration;

fn create_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .unwrap()
}

struct Echo(u64);

impl WorkUnit for Echo {
    type Output = u64;
    type Error = Infallible;

    fn execute(&self) -> Result<u64, Infallible> {
        Ok(black_box(self.0))
    }

    fn abort(&self) {}
}

/// Крутится до abort, как вызов, заблокированный на сокете
struct Parked {
    aborted: AtomicBool,
}

impl WorkUnit for Parked {
    type Output = ();
    type Error = Infallible;

    fn execute(&self) -> Result<(), Infallible> {
        while !self.aborted.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_micros(100));
        }
        Ok(())
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

fn config(workers: usize, queue_bound: usize) -> Config {
    Config::default()
        .with_workers(workers)
        .with_queue_bound(queue_bound)
        .with_default_deadline(None)
        .with_sweep_interval(None)
}

// Benchmark 1: submit + await
fn bench_submit_await(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_await");

    for size in [100, 1000, 10000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("dispatcher", size), &size, |b, &size| {
            let rt = create_runtime();
            let dispatcher = rt
                .block_on(async { Dispatcher::with_config(config(num_cpus::get() * 2, size)) })
                .unwrap();

            b.to_async(&rt).iter(|| {
                let dispatcher = &dispatcher;
                async move {
                    let futures: Vec<_> = (0..size)
                        .map(|i| dispatcher.submit(Echo(i as u64), None).unwrap())
                        .collect();

                    for future in futures {
                        black_box(future.await);
                    }
                }
            });
        });

        // Базовая линия tokio
        group.bench_with_input(BenchmarkId::new("spawn_blocking", size), &size, |b, &size| {
            let rt = create_runtime();

            b.to_async(&rt).iter(|| async move {
                let handles: Vec<_> = (0..size)
                    .map(|i| tokio::task::spawn_blocking(move || black_box(i)))
                    .collect();

                for handle in handles {
                    black_box(handle.await.unwrap());
                }
            });
        });
    }

    group.finish();
}

// Benchmark 2: отмена запросов в очереди
fn bench_cancel_queued(c: &mut Criterion) {
    let mut group = c.benchmark_group("cancel_queued");
    group.sample_size(20);

    for size in [100, 1000] {
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("cancel", size), &size, |b, &size| {
            let rt = create_runtime();

            b.to_async(&rt).iter(|| async move {
                let dispatcher = Dispatcher::with_config(config(1, size)).unwrap();
                let blocker = dispatcher
                    .submit(Parked { aborted: AtomicBool::new(false) }, None)
                    .unwrap();

                let futures: Vec<_> = (0..size)
                    .map(|i| dispatcher.submit(Echo(i as u64), None).unwrap())
                    .collect();
                for future in &futures {
                    black_box(future.cancel());
                }

                dispatcher.cancel_future(&blocker);
                dispatcher.shutdown().await;
            });
        });
    }

    group.finish();
}

// Benchmark 3: задержка abort выполняющегося запроса
fn bench_abort_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("abort_latency");
    group.sample_size(20);

    group.bench_function("abort_running", |b| {
        let rt = create_runtime();
        let dispatcher = rt
            .block_on(async { Dispatcher::with_config(config(4, 4)) })
            .unwrap();

        b.to_async(&rt).iter(|| {
            let dispatcher = &dispatcher;
            async move {
                let future = dispatcher
                    .submit(Parked { aborted: AtomicBool::new(false) }, None)
                    .unwrap();
                while !future.status().is_terminal()
                    && future.status() != call_dispatch::RequestStatus::Running
                {
                    tokio::task::yield_now().await;
                }
                dispatcher.cancel_future(&future);
                black_box(future.get().await);
                dispatcher.join_all().await;
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_submit_await,
    bench_cancel_queued,
    bench_abort_latency,
);

criterion_main!(benches);
