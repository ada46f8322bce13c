//! Claim throughput benchmark
//!
//! Measures the hot path of the in-memory backend: enqueue → claim → complete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use laneq::persistence::{InMemoryQueueBackend, QueueBackend};
use laneq::{JobInstance, LaneConfig, RetryPolicy};

const LEASE: Duration = Duration::from_secs(30);

/// Single consumer claiming batches of increasing size
fn bench_claim_batches(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let ns = LaneConfig::stack("bench").namespace();

    let mut group = c.benchmark_group("claim/batch");
    for batch_size in [1usize, 10, 50] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let ns = ns.clone();
                b.to_async(&rt).iter_custom(move |iters| {
                    let ns = ns.clone();
                    async move {
                        let backend = InMemoryQueueBackend::new();
                        let policy = RetryPolicy::default();
                        let total = iters as usize * batch_size;
                        for i in 0..total {
                            let job = JobInstance::new(
                                "bench",
                                serde_json::json!({ "n": i }),
                                &policy,
                                ns.lane().clone(),
                            );
                            backend.enqueue(&ns, job, Duration::ZERO).await.unwrap();
                        }

                        let start = Instant::now();
                        for _ in 0..iters {
                            let claimed = backend
                                .claim(&ns, "bench-worker", batch_size, LEASE)
                                .await
                                .unwrap();
                            for job in &claimed {
                                backend.complete(&ns, &job.lease).await.unwrap();
                            }
                        }
                        start.elapsed()
                    }
                });
            },
        );
    }
    group.finish();
}

/// Several consumers racing on one namespace
fn bench_concurrent_claims(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let ns = LaneConfig::stack("bench").namespace();
    let jobs_per_iter = 100usize;

    let mut group = c.benchmark_group("claim/concurrent");
    group.throughput(Throughput::Elements(jobs_per_iter as u64));
    for workers in [2usize, 8] {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            let ns = ns.clone();
            b.to_async(&rt).iter_custom(move |iters| {
                let ns = ns.clone();
                async move {
                    let mut elapsed = Duration::ZERO;
                    for _ in 0..iters {
                        let backend = Arc::new(InMemoryQueueBackend::new());
                        let policy = RetryPolicy::default();
                        for i in 0..jobs_per_iter {
                            let job = JobInstance::new(
                                "bench",
                                serde_json::json!({ "n": i }),
                                &policy,
                                ns.lane().clone(),
                            );
                            backend.enqueue(&ns, job, Duration::ZERO).await.unwrap();
                        }

                        let start = Instant::now();
                        let handles: Vec<_> = (0..workers)
                            .map(|w| {
                                let backend = backend.clone();
                                let ns = ns.clone();
                                tokio::spawn(async move {
                                    let worker_id = format!("bench-{w}");
                                    loop {
                                        let claimed =
                                            backend.claim(&ns, &worker_id, 5, LEASE).await.unwrap();
                                        if claimed.is_empty() {
                                            break;
                                        }
                                        for job in &claimed {
                                            backend.complete(&ns, &job.lease).await.unwrap();
                                        }
                                    }
                                })
                            })
                            .collect();
                        for handle in handles {
                            handle.await.unwrap();
                        }
                        elapsed += start.elapsed();
                    }
                    elapsed
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_claim_batches, bench_concurrent_claims);
criterion_main!(benches);
