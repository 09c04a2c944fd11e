//! Benchmarks for lock key encoding and, when a server is available, lock
//! acquisition latency.

use advisory_lock_core::prelude::*;
use advisory_lock_postgres::{PostgresAdvisoryLockKey, PostgresLockProvider};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

fn bench_key_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_encoding");
    group.bench_function("ascii", |b| {
        b.iter(|| PostgresAdvisoryLockKey::from_name(black_box("resource"), false))
    });
    group.bench_function("hex", |b| {
        b.iter(|| PostgresAdvisoryLockKey::from_name(black_box("00000000deadbeef"), false))
    });
    group.bench_function("pair", |b| {
        b.iter(|| PostgresAdvisoryLockKey::from_name(black_box("0000abcd,ffff0000"), false))
    });
    group.bench_function("hashed", |b| {
        b.iter(|| {
            PostgresAdvisoryLockKey::from_name_hashed(black_box(
                "tenants/42/reports/monthly-rollup",
            ))
        })
    });
    group.finish();
}

fn bench_postgres_lock_acquisition(c: &mut Criterion) {
    let Ok(url) = std::env::var("POSTGRES_URL") else {
        return;
    };
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let provider = runtime
        .block_on(PostgresLockProvider::new(url))
        .unwrap();
    let lock = provider.create_lock("bench-lock");

    let mut group = c.benchmark_group("postgres_lock");
    group.bench_function("try_acquire", |b| {
        b.to_async(&runtime).iter(|| async {
            if let Ok(Some(handle)) = lock.try_acquire().await {
                let _ = handle.release().await;
            }
        });
    });

    group.bench_function("acquire_no_wait", |b| {
        b.to_async(&runtime).iter(|| async {
            if let Ok(handle) = lock.acquire(Some(Duration::from_millis(100))).await {
                let _ = handle.release().await;
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_key_encoding, bench_postgres_lock_acquisition);
criterion_main!(benches);
