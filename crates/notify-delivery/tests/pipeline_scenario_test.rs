//! End-to-end scenarios over the in-memory store and bus.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

mod common;

use std::{sync::Arc, time::Duration};

use common::{email_request, Harness, SwitchChannel};
use notify_core::{topics, NotificationStatus, OutboxStatus};
use notify_delivery::{
    channels::EmailChannel, circuit::CircuitConfig, CircuitBreakerChannel, NotificationChannel,
    RetryPolicy,
};

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1000),
        max_delay: Duration::from_millis(10_000),
    }
}

#[tokio::test]
async fn email_is_sent_once_and_duplicate_returns_sent_record() {
    let h = Harness::new(
        vec![Arc::new(EmailChannel::new()), SwitchChannel::healthy()],
        policy(5),
    );

    let created = h.pipeline.send().execute(email_request("k1")).await.unwrap();
    assert_eq!(created.status, NotificationStatus::Pending);

    h.run_until_idle().await;

    let sent = h.stored(&created).await;
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert!(sent.is_clean());

    let again = h.pipeline.send().execute(email_request("k1")).await.unwrap();
    assert_eq!(again.id, created.id);
    assert_eq!(again.status, NotificationStatus::Sent);

    let outbox = h.store.outbox_events().await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].status, OutboxStatus::Published);
    assert_eq!(h.bus.messages(topics::SEND).await.len(), 1);
}

#[tokio::test]
async fn always_failing_channel_dead_letters_after_max_attempts() {
    let channel = SwitchChannel::failing();
    let h = Harness::new(vec![channel.clone()], policy(2));

    let created = h.pipeline.send().execute(email_request("k2")).await.unwrap();
    h.run_until_idle().await;

    let failed = h.stored(&created).await;
    assert_eq!(failed.status, NotificationStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.retryable, Some(true));
    assert_eq!(h.bus.notifications(topics::RETRY).await.len(), 1);
    assert_eq!(channel.calls(), 1);

    // Retry is deferred until due.
    h.clock.advance(Duration::from_millis(1999));
    h.run_until_idle().await;
    assert_eq!(channel.calls(), 1);

    h.clock.advance(Duration::from_millis(1));
    h.run_until_idle().await;

    let dead = h.stored(&created).await;
    assert_eq!(dead.status, NotificationStatus::DeadLettered);
    assert_eq!(dead.retry_count, 2);
    assert_eq!(dead.retryable, Some(false));
    assert_eq!(dead.error_code.as_deref(), Some("DELIVERY_FAILED_MAX_ATTEMPTS"));
    assert_eq!(dead.error_category.as_deref(), Some("DELIVERY"));

    let dlq = h.bus.notifications(topics::DLQ).await;
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].notification.id, created.id);
    assert_eq!(dlq[0].notification.status, NotificationStatus::DeadLettered);
    assert_eq!(h.bus.committed_offset("dlq-group", topics::DLQ).await, 1);
}

#[tokio::test]
async fn reprocessed_dead_letter_is_delivered_once_channel_recovers() {
    let channel = SwitchChannel::failing();
    let h = Harness::new(vec![channel.clone()], policy(1));

    let created = h.pipeline.send().execute(email_request("k3")).await.unwrap();
    h.run_until_idle().await;
    assert_eq!(h.stored(&created).await.status, NotificationStatus::DeadLettered);

    channel.set_failing(false);
    let ids = h.pipeline.reprocess().execute(10).await.unwrap();
    assert_eq!(ids, vec![created.id]);
    assert_eq!(h.stored(&created).await.status, NotificationStatus::DeadLettered);

    h.run_until_idle().await;

    let sent = h.stored(&created).await;
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert!(sent.is_clean());
    assert_eq!(h.bus.messages(topics::SEND).await.len(), 2);
}

#[tokio::test]
async fn open_breaker_fails_fast_and_consumes_an_attempt() {
    let delegate = SwitchChannel::failing();
    let guarded: Arc<dyn NotificationChannel> = Arc::new(CircuitBreakerChannel::new(
        delegate.clone(),
        CircuitConfig::default(),
        Arc::new(notify_core::TestClock::new()),
    ));
    let h = Harness::new(vec![guarded], policy(5));

    let mut created = Vec::new();
    for i in 0..6 {
        created.push(h.pipeline.send().execute(email_request(&format!("b{i}"))).await.unwrap());
    }
    h.run_until_idle().await;

    assert_eq!(delegate.calls(), 5);
    let sixth = h.stored(&created[5]).await;
    assert_eq!(sixth.status, NotificationStatus::Failed);
    assert_eq!(sixth.retry_count, 1);
    assert!(sixth.error_message.unwrap().contains("circuit breaker open"));
}

#[tokio::test]
async fn redelivered_send_message_does_not_resend() {
    let channel = SwitchChannel::healthy();
    let h = Harness::new(vec![channel.clone()], policy(5));

    let created = h.pipeline.send().execute(email_request("k4")).await.unwrap();
    h.run_until_idle().await;
    assert_eq!(channel.calls(), 1);

    // Same snapshot again, as after a crash before the offset commit.
    let outcome = h.pipeline.process().execute(created.clone()).await.unwrap();

    assert_eq!(outcome, notify_delivery::DeliveryOutcome::Skipped);
    assert_eq!(channel.calls(), 1);
}

#[tokio::test]
async fn concurrent_duplicate_submissions_create_one_notification() {
    let h = Arc::new(Harness::new(vec![SwitchChannel::healthy()], policy(5)));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let h = h.clone();
        handles.push(tokio::spawn(async move {
            h.pipeline.send().execute(email_request("same-key")).await.unwrap().id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }

    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(h.store.notifications().await.len(), 1);
    assert_eq!(h.store.outbox_events().await.len(), 1);
}

#[tokio::test]
async fn undecodable_send_record_is_reported_to_dlq() {
    use notify_delivery::MessagePublisher;

    let h = Harness::new(vec![SwitchChannel::healthy()], policy(5));
    h.bus.publish(topics::SEND, Some("x"), b"{not json".to_vec()).await.unwrap();

    h.run_until_idle().await;

    let dlq = h.bus.messages(topics::DLQ).await;
    assert_eq!(dlq.len(), 1);
    let report: notify_core::DlqErrorMessage = serde_json::from_slice(&dlq[0].payload).unwrap();
    assert_eq!(report.source_topic, topics::SEND);
    assert_eq!(report.raw_payload, "{not json");
    assert_eq!(h.bus.committed_offset("send-group", topics::SEND).await, 1);
}
