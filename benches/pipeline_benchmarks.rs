//! Benchmarks for the per-notification hot paths: backoff decisions,
//! admission rate limiting, intake and message decoding.

use std::{hint::black_box, sync::Arc, time::Duration};

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use notify_core::{Clock, Notification, NotificationMessage, NotificationType, RealClock};
use notify_delivery::{
    idempotency::IdempotencyLock, rate_limit::RateLimiter, retry::SeededJitter,
    storage::mock::MockNotificationStore, BackoffPolicy, CreateNotification, RetryPolicy,
    SendNotification,
};
use tokio::runtime::Runtime;

/// Benchmarks retry decisions across the backoff curve.
fn bench_backoff(c: &mut Criterion) {
    let backoff = BackoffPolicy::new(RetryPolicy {
        max_attempts: 64,
        ..RetryPolicy::default()
    })
    .with_jitter(Arc::new(SeededJitter::new(7)));
    let now = Utc::now();

    let mut group = c.benchmark_group("backoff");
    for retry_count in [1_u32, 5, 20, 63] {
        group.bench_with_input(BenchmarkId::new("decide", retry_count), &retry_count, |b, &n| {
            b.iter(|| backoff.decide(black_box(NotificationType::Webhook), black_box(n), now));
        });
    }
    group.finish();
}

/// Benchmarks admission checks for hot and spread keys.
fn bench_rate_limiter(c: &mut Criterion) {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let mut group = c.benchmark_group("rate_limit");
    group.throughput(Throughput::Elements(1));

    let limiter = RateLimiter::new(u32::MAX, clock.clone());
    group.bench_function("single_key", |b| {
        b.iter(|| limiter.try_acquire(black_box("client:hot")));
    });

    let limiter = RateLimiter::new(u32::MAX, clock);
    let keys: Vec<String> = (0..1024).map(|i| format!("recipient:user-{i}")).collect();
    let mut next = 0;
    group.bench_function("1024_keys", |b| {
        b.iter(|| {
            next = (next + 1) % keys.len();
            limiter.try_acquire(black_box(&keys[next]))
        });
    });

    group.finish();
}

/// Benchmarks intake against the in-memory store, new keys and duplicates.
fn bench_intake(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store = MockNotificationStore::new();
    let send = SendNotification::new(
        Arc::new(store),
        Arc::new(RateLimiter::new(u32::MAX, clock.clone())),
        Arc::new(IdempotencyLock::new()),
        clock,
    );

    let request = |key: String| CreateNotification {
        notification_type: NotificationType::Email,
        recipient: "bench@example.com".to_string(),
        client_id: "bench".to_string(),
        payload: r#"{"subject":"s","body":"b","from":"f"}"#.to_string(),
        idempotency_key: key,
    };

    let mut group = c.benchmark_group("intake");
    group.measurement_time(Duration::from_secs(5));

    let mut counter = 0_u64;
    group.bench_function("new_key", |b| {
        b.iter(|| {
            counter += 1;
            rt.block_on(send.execute(request(format!("bench-{counter}")))).unwrap()
        });
    });

    rt.block_on(send.execute(request("duplicate".to_string()))).unwrap();
    group.bench_function("duplicate_key", |b| {
        b.iter(|| rt.block_on(send.execute(request("duplicate".to_string()))).unwrap());
    });

    group.finish();
}

/// Benchmarks decoding of bus envelopes.
fn bench_decode(c: &mut Criterion) {
    let notification = Notification::new(
        NotificationType::Webhook,
        "hooks",
        "client",
        r#"{"url":"http://localhost/hook","body":"{}"}"#,
        "key",
        Utc::now(),
    );
    let payload = NotificationMessage::new(&notification, Utc::now()).encode().unwrap();

    c.bench_function("decode_notification_message", |b| {
        b.iter(|| NotificationMessage::decode(black_box(&payload)).unwrap());
    });
}

criterion_group!(benches, bench_backoff, bench_rate_limiter, bench_intake, bench_decode);
criterion_main!(benches);
