//! Running pipeline over the in-memory store and bus.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{sync::Arc, time::Duration};

use notify_core::{
    topics, Clock, Notification, NotificationId, NotificationStatus, NotificationType, RealClock,
};
use notify_delivery::{
    bus::mock::InMemoryBus,
    channels::{EmailChannel, WebhookChannel, WebhookConfig},
    consumer::ConsumerConfig,
    storage::mock::MockNotificationStore,
    BackoffPolicy, ChannelRegistry, CreateNotification, NotificationChannel, NotificationStore,
    Pipeline, PipelineConfig, RetryPolicy, TopicConsumers,
};
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        consumer: ConsumerConfig { batch_size: 10, poll_interval: Duration::from_millis(10) },
        outbox_poll_interval: Duration::from_millis(10),
        publish_retry_delay: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

async fn start(store: &MockNotificationStore, bus: &InMemoryBus, max_attempts: u32) -> Pipeline {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let channels: Vec<Arc<dyn NotificationChannel>> = vec![
        Arc::new(EmailChannel::new()),
        Arc::new(WebhookChannel::new(WebhookConfig::default()).unwrap()),
    ];
    let backoff = BackoffPolicy::new(RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    });

    let mut pipeline = Pipeline::new(
        fast_config(),
        Arc::new(store.clone()),
        Arc::new(bus.clone()),
        ChannelRegistry::new(channels),
        backoff,
        clock,
    )
    .unwrap();

    pipeline
        .start(TopicConsumers {
            send: Arc::new(bus.consumer("send", topics::SEND)),
            retry: Arc::new(bus.consumer("retry", topics::RETRY)),
            dlq: Arc::new(bus.consumer("dlq", topics::DLQ)),
        })
        .await;
    pipeline
}

fn webhook_request(server: &MockServer, key: &str) -> CreateNotification {
    let payload = serde_json::json!({
        "url": format!("{}/hooks/orders", server.uri()),
        "body": r#"{"order":42}"#,
    });
    CreateNotification {
        notification_type: NotificationType::Webhook,
        recipient: "orders-service".to_string(),
        client_id: "client-9".to_string(),
        payload: payload.to_string(),
        idempotency_key: key.to_string(),
    }
}

async fn wait_for_status(
    pipeline: &Pipeline,
    id: NotificationId,
    status: NotificationStatus,
) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(current) = pipeline.query().execute(id).await.unwrap() {
                if current.status == status {
                    return current;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("notification {id} never reached {status}"))
}

#[tokio::test]
async fn webhook_notification_is_delivered_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let store = MockNotificationStore::new();
    let bus = InMemoryBus::new();
    let pipeline = start(&store, &bus, 5).await;

    let created = pipeline.send().execute(webhook_request(&server, "order-42")).await.unwrap();
    let sent = wait_for_status(&pipeline, created.id, NotificationStatus::Sent).await;

    assert_eq!(sent.retry_count, 0);
    assert!(sent.is_clean());
    assert_eq!(pipeline.stats().await.sent, 1);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn failing_webhook_ends_in_dlq_topic() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(2)
        .mount(&server)
        .await;
    let store = MockNotificationStore::new();
    let bus = InMemoryBus::new();
    let pipeline = start(&store, &bus, 2).await;

    let created = pipeline.send().execute(webhook_request(&server, "order-43")).await.unwrap();
    let dead = wait_for_status(&pipeline, created.id, NotificationStatus::DeadLettered).await;

    assert_eq!(dead.retry_count, 2);
    assert!(dead.error_message.unwrap().contains("500"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while bus.notifications(topics::DLQ).await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("dead letter never reached the dlq topic");

    let stats = pipeline.stats().await;
    assert_eq!(stats.send_attempts, 2);
    assert_eq!(stats.dead_lettered, 1);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn orphaned_outbox_event_stops_the_poller() {
    let store = MockNotificationStore::new();
    let bus = InMemoryBus::new();

    let orphan = Notification::new(
        NotificationType::Email,
        "a@b.c",
        "c1",
        "{}",
        "orphan",
        RealClock::new().now_utc(),
    );
    store.save_with_outbox(&orphan, topics::SEND).await.unwrap();
    store.remove_notification(orphan.id).await;

    let pipeline = start(&store, &bus, 5).await;

    let exited = tokio::time::timeout(Duration::from_secs(5), pipeline.wait_for_exit())
        .await
        .expect("poller should stop on a broken outbox row");

    assert_eq!(exited, "outbox");
    assert!(bus.messages(topics::SEND).await.is_empty());
    pipeline.shutdown().await.unwrap();
}
