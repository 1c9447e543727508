//! Topic consumer loops.
//!
//! A [`ConsumerLoop`] polls one topic for one consumer group and hands each
//! record, in order, to a [`RecordHandler`]. The record is committed only
//! after the handler is done with it, so a crash replays uncommitted work.
//!
//! Per record:
//! - handled: commit and continue;
//! - deferred (not due yet): stop the batch without committing;
//! - undecodable: publish a [`DlqErrorMessage`] to the dlq topic, commit;
//! - fatal error: stop the loop with the error;
//! - any other error: log and stop the batch without committing.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use notify_core::{topics, Clock, DlqErrorMessage, NotificationMessage};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bus::{BusRecord, MessageConsumer, MessagePublisher},
    error::{DeliveryError, Result},
    process::{ProcessNotification, RetryNotification},
    stats::SharedStats,
};

/// Delay after a failed poll before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What to do with a record after the handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done; commit the record.
    Commit,
    /// Not yet; leave it uncommitted and stop the batch.
    Defer,
}

/// Processes records of one topic.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Handles one record.
    ///
    /// # Errors
    ///
    /// `DeliveryError::Deserialization` routes the record to the dlq topic.
    async fn handle(&self, record: &BusRecord) -> Result<Disposition>;
}

fn decode(record: &BusRecord) -> Result<NotificationMessage> {
    NotificationMessage::decode(&record.payload)
        .map_err(|e| DeliveryError::deserialization(e.to_string()))
}

/// Send topic: one delivery attempt per record.
pub struct SendHandler {
    process: ProcessNotification,
}

impl SendHandler {
    /// Creates the handler.
    pub fn new(process: ProcessNotification) -> Self {
        Self { process }
    }
}

#[async_trait]
impl RecordHandler for SendHandler {
    fn name(&self) -> &'static str {
        "send"
    }

    async fn handle(&self, record: &BusRecord) -> Result<Disposition> {
        let message = decode(record)?;
        let outcome = self.process.execute(message.notification.into()).await?;
        debug!(offset = record.offset, outcome = ?outcome, "send record handled");
        Ok(Disposition::Commit)
    }
}

/// Retry topic: a delivery attempt once the retry is due.
///
/// A record that is not due yet is deferred, which holds back the records
/// behind it until it becomes due. The wait is bounded by the deferred
/// record's `next_retry_at`, which is never further out than the retry
/// policy's `max_delay` from the failure that scheduled it (300s by
/// default). Records behind it that are already due are delivered late by
/// at most that much, never skipped.
pub struct RetryHandler {
    retry: RetryNotification,
}

impl RetryHandler {
    /// Creates the handler.
    pub fn new(retry: RetryNotification) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl RecordHandler for RetryHandler {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn handle(&self, record: &BusRecord) -> Result<Disposition> {
        let message = decode(record)?;
        if self.retry.execute(message.notification.into()).await? {
            Ok(Disposition::Commit)
        } else {
            Ok(Disposition::Defer)
        }
    }
}

/// Dlq topic: terminal failures and parse reports are logged and committed.
#[derive(Debug, Default)]
pub struct DlqObserver;

#[async_trait]
impl RecordHandler for DlqObserver {
    fn name(&self) -> &'static str {
        "dlq"
    }

    async fn handle(&self, record: &BusRecord) -> Result<Disposition> {
        warn!(
            key = record.key.as_deref().unwrap_or("-"),
            offset = record.offset,
            payload = %String::from_utf8_lossy(&record.payload),
            "dead-letter record received"
        );
        Ok(Disposition::Commit)
    }
}

/// Consumer loop tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum records per poll.
    pub batch_size: usize,
    /// Idle wait between empty polls.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { batch_size: 100, poll_interval: Duration::from_millis(500) }
    }
}

/// Poll-handle-commit loop over one topic.
pub struct ConsumerLoop {
    consumer: Arc<dyn MessageConsumer>,
    handler: Arc<dyn RecordHandler>,
    dlq_publisher: Arc<dyn MessagePublisher>,
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    stats: SharedStats,
    cancellation_token: CancellationToken,
}

impl ConsumerLoop {
    /// Creates a loop.
    pub fn new(
        consumer: Arc<dyn MessageConsumer>,
        handler: Arc<dyn RecordHandler>,
        dlq_publisher: Arc<dyn MessagePublisher>,
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
        stats: SharedStats,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { consumer, handler, dlq_publisher, config, clock, stats, cancellation_token }
    }

    /// Name of the handler driving this loop.
    pub fn name(&self) -> &'static str {
        self.handler.name()
    }

    /// Polls until cancelled.
    ///
    /// An in-flight batch is always finished before the loop checks for
    /// cancellation again.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error.
    pub async fn run(&self) -> Result<()> {
        info!(
            handler = self.handler.name(),
            topic = self.consumer.topic(),
            batch_size = self.config.batch_size,
            "consumer loop starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.process_batch().await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => continue,
                Err(error) if error.is_fatal() => {
                    error!(
                        handler = self.handler.name(),
                        error = %error,
                        "consumer loop stopping on fatal error"
                    );
                    return Err(error);
                },
                Err(error) => {
                    error!(
                        handler = self.handler.name(),
                        error = %error,
                        "consumer batch failed"
                    );
                    ERROR_BACKOFF
                },
            };

            tokio::select! {
                () = self.clock.sleep(pause) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(handler = self.handler.name(), "consumer loop stopped");
        Ok(())
    }

    /// Polls one batch and returns the number of records committed.
    ///
    /// # Errors
    ///
    /// Returns poll and commit failures, and fatal handler errors.
    pub async fn process_batch(&self) -> Result<usize> {
        let records = self.consumer.poll(self.config.batch_size).await?;
        let mut committed = 0;

        for record in &records {
            match self.handler.handle(record).await {
                Ok(Disposition::Commit) => {},
                Ok(Disposition::Defer) => {
                    debug!(
                        handler = self.handler.name(),
                        offset = record.offset,
                        "record deferred"
                    );
                    break;
                },
                Err(DeliveryError::Deserialization { message }) => {
                    self.route_to_dlq(record, &message).await?;
                },
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    error!(
                        handler = self.handler.name(),
                        key = record.key.as_deref().unwrap_or("-"),
                        topic = %record.topic,
                        offset = record.offset,
                        error = %error,
                        "record handling failed, will be redelivered"
                    );
                    break;
                },
            }

            self.consumer.commit(record).await?;
            committed += 1;
        }

        Ok(committed)
    }

    async fn route_to_dlq(&self, record: &BusRecord, reason: &str) -> Result<()> {
        let report = DlqErrorMessage::deserialization(
            &record.topic,
            record.partition,
            record.offset,
            &record.payload,
            self.clock.now_utc(),
        );
        let payload =
            report.encode().map_err(|e| DeliveryError::publish(topics::DLQ, e.to_string()))?;
        let key = uuid::Uuid::new_v4().to_string();
        self.dlq_publisher.publish(topics::DLQ, Some(&key), payload).await?;

        self.stats.write().await.parse_errors += 1;
        warn!(
            topic = %record.topic,
            offset = record.offset,
            error = %reason,
            "undecodable record routed to dlq"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use notify_core::{
        DeliveryFailure, Notification, NotificationStatus, NotificationType, TestClock,
    };

    use super::*;
    use crate::{
        bus::mock::InMemoryBus, channel::NotificationChannel, stats,
        storage::mock::MockNotificationStore, BackoffPolicy, ChannelRegistry,
    };

    /// Commits everything except records whose payload is `b"fail"`.
    struct Picky(AtomicUsize);

    #[async_trait]
    impl RecordHandler for Picky {
        fn name(&self) -> &'static str {
            "picky"
        }

        async fn handle(&self, record: &BusRecord) -> Result<Disposition> {
            self.0.fetch_add(1, Ordering::SeqCst);
            match record.payload.as_slice() {
                b"fail" => Err(DeliveryError::storage("transient")),
                b"later" => Ok(Disposition::Defer),
                b"fatal" => Err(DeliveryError::integrity("broken")),
                b"garbage" => Err(DeliveryError::deserialization("expected value")),
                _ => Ok(Disposition::Commit),
            }
        }
    }

    fn consumer_loop(bus: &InMemoryBus, handler: Arc<dyn RecordHandler>) -> ConsumerLoop {
        ConsumerLoop::new(
            Arc::new(bus.consumer("g", "t")),
            handler,
            Arc::new(bus.clone()),
            ConsumerConfig::default(),
            Arc::new(TestClock::new()),
            stats::shared(),
            CancellationToken::new(),
        )
    }

    async fn publish_all(bus: &InMemoryBus, payloads: &[&[u8]]) {
        for payload in payloads {
            bus.publish("t", None, payload.to_vec()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn handler_failure_stops_batch_without_commit() {
        let bus = InMemoryBus::new();
        publish_all(&bus, &[b"ok", b"fail", b"ok"]).await;
        let handler = Arc::new(Picky(AtomicUsize::new(0)));
        let lp = consumer_loop(&bus, handler.clone());

        assert_eq!(lp.process_batch().await.unwrap(), 1);
        assert_eq!(bus.committed_offset("g", "t").await, 1);
        assert_eq!(handler.0.load(Ordering::SeqCst), 2);

        // The failed record comes back first.
        assert_eq!(lp.process_batch().await.unwrap(), 0);
        assert_eq!(handler.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deferred_record_is_left_uncommitted() {
        let bus = InMemoryBus::new();
        publish_all(&bus, &[b"later", b"ok"]).await;
        let lp = consumer_loop(&bus, Arc::new(Picky(AtomicUsize::new(0))));

        assert_eq!(lp.process_batch().await.unwrap(), 0);
        assert_eq!(bus.committed_offset("g", "t").await, 0);
    }

    #[tokio::test]
    async fn undecodable_record_goes_to_dlq_and_is_committed() {
        let bus = InMemoryBus::new();
        publish_all(&bus, &[b"garbage", b"ok"]).await;
        let lp = consumer_loop(&bus, Arc::new(Picky(AtomicUsize::new(0))));

        assert_eq!(lp.process_batch().await.unwrap(), 2);

        let dlq = bus.messages(topics::DLQ).await;
        assert_eq!(dlq.len(), 1);
        let report: DlqErrorMessage = serde_json::from_slice(&dlq[0].payload).unwrap();
        assert_eq!(report.reason, "DESERIALIZATION_ERROR");
        assert_eq!(report.source_topic, "t");
        assert_eq!(report.source_offset, 0);
        assert_eq!(report.raw_payload, "garbage");
        assert_eq!(lp.stats.read().await.parse_errors, 1);
    }

    #[tokio::test]
    async fn fatal_error_terminates_loop() {
        let bus = InMemoryBus::new();
        publish_all(&bus, &[b"fatal"]).await;
        let lp = consumer_loop(&bus, Arc::new(Picky(AtomicUsize::new(0))));

        let error = lp.run().await.unwrap_err();

        assert!(matches!(error, DeliveryError::Integrity { .. }));
        assert_eq!(bus.committed_offset("g", "t").await, 0);
    }

    #[tokio::test]
    async fn dlq_observer_commits_everything() {
        let bus = InMemoryBus::new();
        publish_all(&bus, &[b"{}", b"not json"]).await;
        let lp = consumer_loop(&bus, Arc::new(DlqObserver));

        assert_eq!(lp.process_batch().await.unwrap(), 2);
        assert_eq!(lp.process_batch().await.unwrap(), 0);
    }

    struct Delivered;

    #[async_trait]
    impl NotificationChannel for Delivered {
        fn name(&self) -> &str {
            "delivered"
        }

        fn supports(&self, _notification_type: NotificationType) -> bool {
            true
        }

        async fn send(&self, _notification: &Notification) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn due_retry_waits_behind_undue_retry_until_it_is_due() {
        let clock = TestClock::new();
        let store = MockNotificationStore::with_clock(Arc::new(clock.clone()));
        let bus = InMemoryBus::with_clock(Arc::new(clock.clone()));
        let process = ProcessNotification::new(
            Arc::new(store.clone()),
            ChannelRegistry::new(vec![Arc::new(Delivered)]),
            BackoffPolicy::default(),
            Arc::new(clock.clone()),
            stats::shared(),
        );
        let handler = RetryHandler::new(RetryNotification::new(process, Arc::new(clock.clone())));
        let lp = ConsumerLoop::new(
            Arc::new(bus.consumer("retry-group", topics::RETRY)),
            Arc::new(handler),
            Arc::new(bus.clone()),
            ConsumerConfig::default(),
            Arc::new(clock.clone()),
            stats::shared(),
            CancellationToken::new(),
        );

        let now = clock.now_utc();
        let failure = DeliveryFailure::new("boom", "DELIVERY");
        let mut scheduled = Vec::new();
        for (key, wait_secs) in [("late", 30), ("due", 0)] {
            let n = Notification::new(NotificationType::Email, "r", "c", "{}", key, now)
                .retry_scheduled(&failure, now + chrono::Duration::seconds(wait_secs), now);
            store.insert(n.clone()).await;
            let payload = NotificationMessage::new(&n, now).encode().unwrap();
            bus.publish(topics::RETRY, Some(&n.id.to_string()), payload).await.unwrap();
            scheduled.push(n.id);
        }

        assert_eq!(lp.process_batch().await.unwrap(), 0);
        let waiting = store.notification(scheduled[1]).await.unwrap();
        assert_eq!(waiting.status, NotificationStatus::Failed);

        clock.advance(Duration::from_secs(29));
        assert_eq!(lp.process_batch().await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(lp.process_batch().await.unwrap(), 2);
        for id in scheduled {
            assert_eq!(store.notification(id).await.unwrap().status, NotificationStatus::Sent);
        }
    }

    #[tokio::test]
    async fn run_exits_when_cancelled() {
        let bus = InMemoryBus::new();
        let lp = consumer_loop(&bus, Arc::new(DlqObserver));
        lp.cancellation_token.cancel();

        assert!(lp.run().await.is_ok());
    }
}
