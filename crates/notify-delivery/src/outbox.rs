//! Outbox publishing.
//!
//! [`PublishOutbox`] moves due outbox events onto the bus: it looks up the
//! notification each event announces, publishes its current state to the
//! event's topic, and marks the event published. A failed publish leaves the
//! event pending with a later due time. [`OutboxPoller`] runs it on a fixed
//! interval.

use std::{sync::Arc, time::Duration};

use notify_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    bus::NotificationPublisher,
    error::{DeliveryError, Result},
    stats::SharedStats,
    storage::NotificationStore,
};

/// Default delay before a failed publish is attempted again.
pub const DEFAULT_PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Outbox publishing use case.
#[derive(Clone)]
pub struct PublishOutbox {
    store: Arc<dyn NotificationStore>,
    publisher: NotificationPublisher,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
    stats: SharedStats,
}

impl PublishOutbox {
    /// Creates the use case.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        publisher: NotificationPublisher,
        clock: Arc<dyn Clock>,
        retry_delay: Duration,
        stats: SharedStats,
    ) -> Self {
        Self { store, publisher, clock, retry_delay, stats }
    }

    /// Publishes up to `limit` due events and returns how many were handled,
    /// published or rescheduled.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Integrity` if an event references a missing
    /// notification and `DeliveryError::Storage` if the store fails. Publish
    /// failures are recorded on the event and are not errors.
    pub async fn execute(&self, limit: usize) -> Result<usize> {
        let now = self.clock.now_utc();
        let events = self.store.fetch_due_outbox(now, limit).await?;

        for event in &events {
            let notification =
                self.store.find_by_id(event.notification_id).await?.ok_or_else(|| {
                    DeliveryError::integrity(format!(
                        "outbox event {} references missing notification {}",
                        event.id, event.notification_id
                    ))
                })?;

            match self.publisher.publish(&event.topic, &notification).await {
                Ok(()) => {
                    self.store.mark_outbox_published(event.id).await?;
                    self.stats.write().await.outbox_published += 1;
                    debug!(
                        outbox_event_id = %event.id,
                        notification_id = %notification.id,
                        topic = %event.topic,
                        "outbox event published"
                    );
                },
                Err(publish_error) => {
                    let next_attempt_at = now
                        + chrono::Duration::from_std(self.retry_delay)
                            .unwrap_or(chrono::Duration::seconds(5));
                    self.store
                        .mark_outbox_failed(event.id, &publish_error.to_string(), next_attempt_at)
                        .await?;
                    self.stats.write().await.outbox_publish_failures += 1;
                    warn!(
                        outbox_event_id = %event.id,
                        topic = %event.topic,
                        attempts = event.attempts.saturating_add(1),
                        next_attempt_at = %next_attempt_at,
                        error = %publish_error,
                        "outbox publish failed"
                    );
                },
            }
        }

        Ok(events.len())
    }
}

/// Runs [`PublishOutbox`] periodically until cancelled.
pub struct OutboxPoller {
    publish: PublishOutbox,
    poll_interval: Duration,
    batch_limit: usize,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
}

impl OutboxPoller {
    /// Creates a poller.
    pub fn new(
        publish: PublishOutbox,
        poll_interval: Duration,
        batch_limit: usize,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { publish, poll_interval, batch_limit, clock, cancellation_token }
    }

    /// Polls until cancelled.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, e.g. an integrity violation. Other
    /// errors are logged and the next cycle runs as scheduled.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            batch_limit = self.batch_limit,
            "outbox poller starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.publish.execute(self.batch_limit).await {
                Ok(handled) if handled > 0 => debug!(handled, "outbox cycle completed"),
                Ok(_) => {},
                Err(error) if error.is_fatal() => {
                    error!(error = %error, "outbox poller stopping on fatal error");
                    return Err(error);
                },
                Err(error) => error!(error = %error, "outbox cycle failed"),
            }

            tokio::select! {
                () = self.clock.sleep(self.poll_interval) => {}
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!("outbox poller stopped");
        Ok(())
    }
}
