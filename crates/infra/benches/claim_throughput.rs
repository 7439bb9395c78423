use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration, TimeZone, Utc};
use queuectl_core::{NewJob, WorkerId};
use queuectl_infra::jobs::{InMemoryJobStore, JobStore};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Pending backlog of `size` jobs spread over priorities and creation times.
fn backlog(rt: &Runtime, size: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    rt.block_on(async {
        for i in 0..size {
            let job = NewJob::new(format!("seed-{i}"), "true").with_priority((i % 5) as i64);
            store
                .enqueue(job, t0 + Duration::seconds(i as i64))
                .await
                .unwrap();
        }
    });
    store
}

fn bench_claim_and_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_and_complete");
    group.throughput(Throughput::Elements(1));

    for size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let rt = runtime();
            let store = backlog(&rt, size);
            let worker = WorkerId::new("worker-bench");
            let now = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
            let mut next = 0u64;

            b.iter(|| {
                rt.block_on(async {
                    let job = store.claim(&worker, now).await.unwrap().unwrap();
                    store.mark_completed(&job.id, &worker, now).await.unwrap();
                    // Keep the backlog at a constant size.
                    next += 1;
                    store
                        .enqueue(NewJob::new(format!("refill-{next}"), "true"), now)
                        .await
                        .unwrap();
                    black_box(job);
                });
            });
        });
    }

    group.finish();
}

fn bench_empty_claim(c: &mut Criterion) {
    let rt = runtime();
    let store = backlog(&rt, 0);
    let worker = WorkerId::new("worker-bench");
    let now = Utc::now();

    c.bench_function("claim_empty_queue", |b| {
        b.iter(|| rt.block_on(async { black_box(store.claim(&worker, now).await.unwrap()) }));
    });
}

criterion_group!(benches, bench_claim_and_complete, bench_empty_claim);
criterion_main!(benches);
