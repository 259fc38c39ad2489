use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use finpulse_ai::{AiError, AnalysisKind, AnalysisRequest, AnalysisResult};
use finpulse_core::TenantId;
use finpulse_resilience::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, TtlCache, process_in_batches,
};
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn request(metrics: usize) -> AnalysisRequest {
    (0..metrics).fold(
        AnalysisRequest::new(TenantId::new(), AnalysisKind::Summary),
        |req, i| req.with_metric(format!("metric_{i}"), 1_000.0 + i as f64 * 17.3),
    )
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("ttl_cache");
    group.sample_size(1000);

    let ttl = Duration::from_secs(3600);
    let cache = TtlCache::new("bench");
    let value = AnalysisResult::new("revenue flat week over week", 0.5, 0.9);
    cache.set("ai:summary:hit", &value).unwrap();

    group.bench_function("get_hit", |b| {
        b.iter(|| {
            let hit: Option<AnalysisResult> = cache.get(black_box("ai:summary:hit"), ttl);
            black_box(hit)
        })
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| {
            let miss: Option<AnalysisResult> = cache.get(black_box("ai:summary:absent"), ttl);
            black_box(miss)
        })
    });

    group.bench_function("set", |b| {
        b.iter(|| cache.set(black_box("ai:summary:hit"), &value).unwrap())
    });

    group.finish();
}

fn bench_cache_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis_cache_key");

    for metrics in [1usize, 10, 50].iter() {
        let req = request(*metrics);
        group.throughput(Throughput::Elements(*metrics as u64));
        group.bench_with_input(BenchmarkId::new("derive", metrics), &req, |b, req| {
            b.iter(|| black_box(req.cache_key()))
        });
    }

    group.finish();
}

fn bench_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let rt = runtime();

    let closed = CircuitBreaker::new("bench-closed", CircuitBreakerConfig::default());
    group.bench_function("execute_closed_success", |b| {
        b.iter(|| {
            rt.block_on(closed.execute(|| async { Ok::<_, AiError>(black_box(42u64)) }))
                .unwrap()
        })
    });

    let open = CircuitBreaker::new(
        "bench-open",
        CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_reset_timeout(Duration::from_secs(3600)),
    );
    let _ = rt.block_on(open.execute(|| async { Err::<u64, _>(AiError::provider(500, "down")) }));
    group.bench_function("execute_open_rejection", |b| {
        b.iter(|| {
            let res: Result<u64, BreakerError<AiError>> =
                rt.block_on(open.execute(|| async { Ok(1u64) }));
            black_box(res.is_err())
        })
    });

    group.finish();
}

fn bench_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_in_batches");
    let rt = runtime();

    for units in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*units as u64));
        group.bench_with_input(BenchmarkId::new("noop_units", units), units, |b, &units| {
            b.iter(|| {
                let results = rt.block_on(process_in_batches(
                    (0..units).collect::<Vec<_>>(),
                    |i| async move { if i % 10 == 0 { Err(i) } else { Ok(i * 2) } },
                    5,
                ));
                black_box(results.len())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cache,
    bench_cache_key,
    bench_breaker,
    bench_batches
);
criterion_main!(benches);
