use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fleetmesh_core::prelude::*;
use std::time::Duration;
use tokio::runtime::Runtime;

fn closed_path_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cb = CircuitBreaker::new(CircuitBreakerConfig {
        max_failures: 1_000_000,
        timeout: Duration::from_secs(60),
        on_state_change: None,
    });

    c.bench_function("circuit_breaker_closed_execute", |b| {
        b.to_async(&rt).iter(|| async {
            let result = cb.execute(|| async { Ok::<_, &str>(1) }).await;
            black_box(result).unwrap()
        });
    });
}

fn open_path_short_circuit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let cb = CircuitBreaker::new(CircuitBreakerConfig {
        max_failures: 1,
        timeout: Duration::from_secs(3600),
        on_state_change: None,
    });
    rt.block_on(async {
        let _ = cb.execute(|| async { Err::<(), _>("boom") }).await;
    });

    c.bench_function("circuit_breaker_open_short_circuit", |b| {
        b.to_async(&rt).iter(|| async {
            let result = cb.execute(|| async { Ok::<_, &str>(1) }).await;
            black_box(result.unwrap_err())
        });
    });
}

criterion_group!(benches, closed_path_throughput, open_path_short_circuit);
criterion_main!(benches);
