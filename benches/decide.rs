use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use durable_throttle::{MemoryStore, Policy, ThrottleEngine, ThrottleRequest, WindowUnit};
use tokio::runtime::Runtime;

/// Benchmark pure policy evaluation against growing histories
fn bench_policy_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_evaluation");
    let policy = Policy::builder()
        .per(WindowUnit::Minute, 10)
        .per(WindowUnit::Hour, 100)
        .per(WindowUnit::Day, 1_000)
        .build()
        .unwrap();
    let now = Utc::now();

    for history_len in [0usize, 10, 100, 1_000].iter() {
        let history: Vec<_> = (0..*history_len)
            .map(|i| now - Duration::seconds(i as i64 * 60))
            .collect();

        group.throughput(Throughput::Elements(*history_len as u64));
        group.bench_with_input(
            BenchmarkId::new("history", history_len),
            &history,
            |b, history| b.iter(|| policy.evaluate(black_box(now), black_box(history))),
        );
    }

    group.finish();
}

/// Benchmark full decisions through the in-memory store
fn bench_memory_store_decisions(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_store");
    let rt = Runtime::new().unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("admit_distinct_keys", |b| {
        let engine = ThrottleEngine::new(MemoryStore::new());
        let policy = Policy::per(WindowUnit::Hour, 10);
        let mut n = 0u64;
        b.to_async(&rt).iter(|| {
            n += 1;
            let request = ThrottleRequest::new("bench", format!("key:{n}"), policy.clone());
            let engine = engine.clone();
            async move { black_box(engine.admit(&request).await.unwrap()) }
        })
    });

    group.bench_function("throttled_hot_key", |b| {
        let engine = ThrottleEngine::new(MemoryStore::new());
        let request = ThrottleRequest::new("bench", "hot", Policy::per(WindowUnit::Day, 50));
        rt.block_on(async {
            for _ in 0..50 {
                engine.admit(&request).await.unwrap();
            }
        });
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            let request = request.clone();
            async move { black_box(engine.admit(&request).await.unwrap()) }
        })
    });

    group.finish();
}

/// Benchmark contended decisions on one key from many tasks
fn bench_contended_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_key");
    let rt = Runtime::new().unwrap();

    for tasks in [2usize, 8, 32].iter() {
        group.throughput(Throughput::Elements(*tasks as u64));
        group.bench_with_input(BenchmarkId::new("tasks", tasks), tasks, |b, &tasks| {
            let engine = ThrottleEngine::new(MemoryStore::new());
            let request =
                ThrottleRequest::new("bench", "contended", Policy::per(WindowUnit::Second, 1));
            b.to_async(&rt).iter(|| {
                let engine = engine.clone();
                let request = request.clone();
                async move {
                    let handles: Vec<_> = (0..tasks)
                        .map(|_| {
                            let engine = engine.clone();
                            let request = request.clone();
                            tokio::spawn(async move { engine.admit(&request).await })
                        })
                        .collect();
                    for handle in handles {
                        black_box(handle.await.unwrap().unwrap());
                    }
                }
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_policy_evaluation,
    bench_memory_store_decisions,
    bench_contended_key
);
criterion_main!(benches);
