//! Retention of delivered bookkeeping.
//!
//! Published outbox events and bus records that every consumer group has
//! read are only history. [`PruneRetention`] deletes those older than the
//! retention period; [`RetentionSweeper`] runs it on a fixed interval.
//! Pending outbox events and unread records are never touched.

use std::{sync::Arc, time::Duration};

use notify_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::MessageConsumer,
    error::{DeliveryError, Result},
    stats::SharedStats,
    storage::NotificationStore,
};

/// Default age after which delivered bookkeeping is deleted.
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Published outbox events deleted.
    pub outbox_events: u64,
    /// Consumed bus records deleted.
    pub bus_records: u64,
}

/// Retention use case.
#[derive(Clone)]
pub struct PruneRetention {
    store: Arc<dyn NotificationStore>,
    consumers: Vec<Arc<dyn MessageConsumer>>,
    clock: Arc<dyn Clock>,
    retention_period: Duration,
    stats: SharedStats,
}

impl PruneRetention {
    /// Creates the use case over the consumers whose topics are pruned.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        consumers: Vec<Arc<dyn MessageConsumer>>,
        clock: Arc<dyn Clock>,
        retention_period: Duration,
        stats: SharedStats,
    ) -> Self {
        Self { store, consumers, clock, retention_period, stats }
    }

    /// Deletes everything older than the retention period that is no longer
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` or the bus error of the first failing
    /// delete. Rows deleted before the failure stay deleted.
    pub async fn execute(&self) -> Result<PruneReport> {
        let retention = chrono::Duration::from_std(self.retention_period)
            .map_err(|e| DeliveryError::configuration(format!("retention period: {e}")))?;
        let cutoff = self.clock.now_utc() - retention;

        let mut report = PruneReport {
            outbox_events: self.store.delete_published_outbox(cutoff).await?,
            ..PruneReport::default()
        };
        for consumer in &self.consumers {
            let pruned = consumer.prune_consumed(cutoff).await?;
            if pruned > 0 {
                debug!(topic = consumer.topic(), pruned, "consumed bus records pruned");
            }
            report.bus_records += pruned;
        }

        let mut stats = self.stats.write().await;
        stats.outbox_events_pruned += report.outbox_events;
        stats.bus_records_pruned += report.bus_records;

        Ok(report)
    }
}

/// Runs [`PruneRetention`] periodically until cancelled.
pub struct RetentionSweeper {
    prune: PruneRetention,
    interval: Duration,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl RetentionSweeper {
    /// Creates a sweeper.
    pub fn new(
        prune: PruneRetention,
        interval: Duration,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { prune, interval, clock, cancellation_token }
    }

    /// Sweeps until cancelled. Failed sweeps are logged and retried on the
    /// next interval.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error.
    pub async fn run(&self) -> Result<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.prune.retention_period.as_secs(),
            "retention sweeper starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            tokio::select! {
                () = self.clock.sleep(self.interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }

            match self.prune.execute().await {
                Ok(report) if report != PruneReport::default() => info!(
                    outbox_events = report.outbox_events,
                    bus_records = report.bus_records,
                    "retention sweep completed"
                ),
                Ok(_) => {},
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => warn!(error = %error, "retention sweep failed"),
            }
        }

        info!("retention sweeper stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use notify_core::{topics, Notification, NotificationType, OutboxStatus, TestClock};

    use super::*;
    use crate::{
        bus::{mock::InMemoryBus, MessagePublisher},
        stats,
        storage::mock::MockNotificationStore,
    };

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        clock: TestClock,
        store: MockNotificationStore,
        bus: InMemoryBus,
        prune: PruneRetention,
    }

    fn fixture() -> Fixture {
        let clock = TestClock::new();
        let store = MockNotificationStore::with_clock(Arc::new(clock.clone()));
        let bus = InMemoryBus::with_clock(Arc::new(clock.clone()));
        let prune = PruneRetention::new(
            Arc::new(store.clone()),
            vec![Arc::new(bus.consumer("send-group", topics::SEND))],
            Arc::new(clock.clone()),
            HOUR,
            stats::shared(),
        );
        Fixture { clock, store, bus, prune }
    }

    async fn published_event(f: &Fixture, key: &str) {
        let n = Notification::new(NotificationType::Email, "r", "c", "{}", key, f.clock.now_utc());
        let event = f.store.save_with_outbox(&n, topics::SEND).await.unwrap();
        f.store.mark_outbox_published(event.id).await.unwrap();
    }

    #[tokio::test]
    async fn nothing_is_pruned_inside_the_retention_period() {
        let f = fixture();
        published_event(&f, "k1").await;
        f.bus.publish(topics::SEND, None, b"x".to_vec()).await.unwrap();

        assert_eq!(f.prune.execute().await.unwrap(), PruneReport::default());
    }

    #[tokio::test]
    async fn old_published_events_and_read_records_are_pruned() {
        let f = fixture();
        published_event(&f, "k1").await;
        for payload in [b"a", b"b"] {
            f.bus.publish(topics::SEND, None, payload.to_vec()).await.unwrap();
        }
        let consumer = f.bus.consumer("send-group", topics::SEND);
        let first = consumer.poll(1).await.unwrap().remove(0);
        consumer.commit(&first).await.unwrap();

        f.clock.advance(HOUR + Duration::from_secs(1));
        let report = f.prune.execute().await.unwrap();

        assert_eq!(report, PruneReport { outbox_events: 1, bus_records: 1 });
        assert!(f.store.outbox_events().await.is_empty());
        assert_eq!(f.bus.messages(topics::SEND).await.len(), 1);
        assert_eq!(f.prune.stats.read().await.bus_records_pruned, 1);
    }

    #[tokio::test]
    async fn pending_events_survive_any_age() {
        let f = fixture();
        let n = Notification::new(NotificationType::Webhook, "r", "c", "{}", "k", f.clock.now_utc());
        f.store.save_with_outbox(&n, topics::RETRY).await.unwrap();

        f.clock.advance(HOUR * 48);
        f.prune.execute().await.unwrap();

        let events = f.store.outbox_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancellation() {
        let f = fixture();
        let token = CancellationToken::new();
        let sweeper =
            RetentionSweeper::new(f.prune.clone(), HOUR, Arc::new(f.clock.clone()), token.clone());
        token.cancel();

        assert!(sweeper.run().await.is_ok());
    }
}
