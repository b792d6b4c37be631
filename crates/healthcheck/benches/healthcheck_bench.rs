use criterion::{Criterion, criterion_group, criterion_main};
use healthcheck::{
    check_endpoint,
    checkers::{HealthChecker, HttpChecker, TcpChecker},
};
use std::collections::BTreeMap;
use std::hint::black_box;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn tcp_check_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcp_check");

    // Nothing listens on port 1, so this measures the failure path
    let checker = Arc::new(TcpChecker::new(
        "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
        Duration::from_millis(100),
    ));

    group.bench_function("tcp_connection_refused", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        b.iter(|| rt.block_on(async { black_box(checker.check().await) }));
    });

    group.finish();
}

fn http_check_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("http_check");
    let rt = tokio::runtime::Runtime::new().unwrap();

    let checker = rt.block_on(async {
        Arc::new(
            HttpChecker::new(
                "http://127.0.0.1:1/health".to_string(),
                &BTreeMap::new(),
                Duration::from_millis(100),
            )
            .unwrap(),
        )
    });

    group.bench_function("http_connection_error", |b| {
        b.iter(|| rt.block_on(async { black_box(checker.check().await) }));
    });

    group.finish();
}

fn single_attempt_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_endpoint");

    let checker = TcpChecker::new(
        "127.0.0.1:1".parse::<SocketAddr>().unwrap(),
        Duration::from_millis(100),
    );

    group.bench_function("single_attempt_refused", |b| {
        let rt = tokio::runtime::Runtime::new().unwrap();
        b.iter(|| {
            rt.block_on(async {
                black_box(check_endpoint(&checker, 1, Duration::ZERO).await)
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    tcp_check_benchmark,
    http_check_benchmark,
    single_attempt_benchmark
);
criterion_main!(benches);
