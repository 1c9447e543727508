//! Shared fixtures for the delivery integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use notify_core::{topics, Clock, Notification, NotificationType, TestClock};
use notify_delivery::{
    bus::mock::InMemoryBus,
    consumer::{
        ConsumerConfig, ConsumerLoop, DlqObserver, RecordHandler, RetryHandler, SendHandler,
    },
    retry::FixedJitter,
    stats,
    storage::mock::MockNotificationStore,
    BackoffPolicy, ChannelRegistry, CreateNotification, DeliveryError, NotificationChannel,
    Pipeline, PipelineConfig, Result, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

/// Channel for every type whose outcome can be switched at runtime.
pub struct SwitchChannel {
    failing: AtomicBool,
    calls: AtomicU32,
}

impl SwitchChannel {
    pub fn failing() -> Arc<Self> {
        Arc::new(Self { failing: AtomicBool::new(true), calls: AtomicU32::new(0) })
    }

    pub fn healthy() -> Arc<Self> {
        Arc::new(Self { failing: AtomicBool::new(false), calls: AtomicU32::new(0) })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for SwitchChannel {
    fn name(&self) -> &str {
        "switch"
    }

    fn supports(&self, _notification_type: NotificationType) -> bool {
        true
    }

    async fn send(&self, _notification: &Notification) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(DeliveryError::channel("downstream unavailable"))
        } else {
            Ok(())
        }
    }
}

/// Pipeline over the in-memory store and bus, stepped by hand.
pub struct Harness {
    pub clock: TestClock,
    pub store: MockNotificationStore,
    pub bus: InMemoryBus,
    pub pipeline: Pipeline,
    loops: Vec<ConsumerLoop>,
}

impl Harness {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, policy: RetryPolicy) -> Self {
        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = MockNotificationStore::with_clock(shared_clock.clone());
        let bus = InMemoryBus::new();
        let backoff =
            BackoffPolicy::new(policy).with_jitter(Arc::new(FixedJitter(Duration::ZERO)));

        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            Arc::new(store.clone()),
            Arc::new(bus.clone()),
            ChannelRegistry::new(channels),
            backoff,
            shared_clock.clone(),
        )
        .unwrap();

        let consumer_loop = |group: &str, topic: &str, handler: Arc<dyn RecordHandler>| {
            ConsumerLoop::new(
                Arc::new(bus.consumer(group, topic)),
                handler,
                Arc::new(bus.clone()),
                ConsumerConfig::default(),
                shared_clock.clone(),
                stats::shared(),
                CancellationToken::new(),
            )
        };
        let loops = vec![
            consumer_loop(
                "send-group",
                topics::SEND,
                Arc::new(SendHandler::new(pipeline.process().clone())) as _,
            ),
            consumer_loop(
                "retry-group",
                topics::RETRY,
                Arc::new(RetryHandler::new(pipeline.retry().clone())) as _,
            ),
            consumer_loop("dlq-group", topics::DLQ, Arc::new(DlqObserver) as _),
        ];

        Self { clock, store, bus, pipeline, loops }
    }

    /// One outbox cycle followed by one batch of every loop. Returns the
    /// amount of work done.
    pub async fn step(&self) -> usize {
        let mut work = self.pipeline.publish_outbox().execute(100).await.unwrap();
        for consumer_loop in &self.loops {
            work += consumer_loop.process_batch().await.unwrap();
        }
        work
    }

    /// Steps until nothing moves.
    pub async fn run_until_idle(&self) {
        for _ in 0..50 {
            if self.step().await == 0 {
                return;
            }
        }
        panic!("pipeline did not settle");
    }

    pub async fn stored(&self, notification: &Notification) -> Notification {
        self.store.notification(notification.id).await.unwrap()
    }
}

pub fn email_request(key: &str) -> CreateNotification {
    CreateNotification {
        notification_type: NotificationType::Email,
        recipient: "user@example.com".to_string(),
        client_id: "client-1".to_string(),
        payload: r#"{"subject":"Welcome","body":"Hello there","from":"noreply@example.com"}"#
            .to_string(),
        idempotency_key: key.to_string(),
    }
}
