use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use std::time::Duration;
use tasque_scheduler::{
    Attempts, InMemoryTaskStore, OwnerId, Outcome, Payload, QueuedTaskInstance, RetryPolicies,
    RetryPolicy, TaskStore, decide,
};

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    let fixed = RetryPolicy::fixed(Duration::from_secs(1));
    let exponential = RetryPolicy::exponential(Duration::from_millis(100), 2.0).unwrap();

    for attempt in [1u32, 10, 1_000] {
        group.bench_with_input(BenchmarkId::new("fixed", attempt), &attempt, |b, &n| {
            b.iter(|| black_box(fixed.backoff(black_box(n))));
        });
        group.bench_with_input(BenchmarkId::new("exponential", attempt), &attempt, |b, &n| {
            b.iter(|| black_box(exponential.backoff(black_box(n))));
        });
    }

    group.finish();
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide");

    let policies = RetryPolicies::none()
        .with_on_failure(
            RetryPolicy::exponential(Duration::from_secs(1), 2.0)
                .unwrap()
                .with_max_retry(5)
                .with_on_max_retry("alert"),
        )
        .with_on_incomplete(RetryPolicy::fixed(Duration::from_secs(60)));
    let now = Utc::now();

    for (label, outcome, attempts) in [
        ("complete", Outcome::Complete, Attempts::new(0, 3)),
        ("incomplete", Outcome::Incomplete, Attempts::new(2, 3)),
        ("failure_reschedule", Outcome::Failure, Attempts::new(2, 3)),
        ("failure_exhausted", Outcome::Failure, Attempts::new(5, 8)),
    ] {
        group.bench_function(label, |b| {
            b.iter(|| black_box(decide(black_box(outcome), attempts, &policies, now)));
        });
    }

    group.finish();
}

fn bench_in_memory_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_memory_claim");

    for due in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(due as u64));
        group.bench_with_input(BenchmarkId::new("claim_due", due), &due, |b, &n| {
            b.iter_batched(
                || {
                    let store = InMemoryTaskStore::new();
                    let payload = Payload::encode("bench").unwrap();
                    for i in 0..n * 2 {
                        // Half due, half in the future
                        let due_at = if i % 2 == 0 {
                            Utc::now() - chrono::Duration::seconds(1)
                        } else {
                            Utc::now() + chrono::Duration::hours(1)
                        };
                        store
                            .insert(QueuedTaskInstance::new("bench", payload.clone(), due_at))
                            .unwrap();
                    }
                    store
                },
                |store| black_box(store.claim_due(OwnerId::new(), Utc::now()).unwrap()),
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_backoff, bench_decide, bench_in_memory_claim);
criterion_main!(benches);
