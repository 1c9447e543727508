//! Delivery state machine.
//!
//! One call to [`ProcessNotification::execute`] is one delivery attempt:
//!
//! ```text
//!   PENDING / FAILED ──send ok──────────────────────▶ SENT
//!          │
//!          └──send failed──┬─ retry_count + 1 < max ─▶ FAILED  (+ outbox → retry)
//!                          └─ retry_count + 1 ≥ max ─▶ DEAD_LETTERED (+ outbox → dlq)
//! ```
//!
//! Failure transitions are written together with an outbox event, so the
//! follow-up message reaches the bus through the outbox poller even if the
//! process dies right after the write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use notify_core::{topics, Clock, DeliveryFailure, Notification, NotificationStatus};
use tracing::{debug, error, info, warn};

use crate::{
    channel::ChannelRegistry,
    error::{DeliveryError, Result},
    retry::{BackoffPolicy, RetryDecision},
    stats::SharedStats,
    storage::NotificationStore,
};

/// What a delivery attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivered; the notification is `SENT`.
    Sent,
    /// Failed; the notification is `FAILED` and due again at the given time.
    RetryScheduled {
        /// When the redelivery becomes due
        next_retry_at: DateTime<Utc>,
    },
    /// Failed for the last time; the notification is `DEAD_LETTERED`.
    DeadLettered,
    /// Redelivered message for work already done; nothing was changed.
    Skipped,
}

/// Delivery use case.
#[derive(Clone)]
pub struct ProcessNotification {
    store: Arc<dyn NotificationStore>,
    registry: ChannelRegistry,
    backoff: BackoffPolicy,
    clock: Arc<dyn Clock>,
    stats: SharedStats,
}

impl ProcessNotification {
    /// Creates the use case.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: ChannelRegistry,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
        stats: SharedStats,
    ) -> Self {
        Self { store, registry, backoff, clock, stats }
    }

    /// Makes one delivery attempt for `notification`.
    ///
    /// The stored record is authoritative: a message for a notification that
    /// is already `SENT`, or whose stored `retry_count` is ahead of the
    /// message's, is skipped.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NoChannel` if no channel supports the type and
    /// `DeliveryError::Storage` if persisting the transition fails. Channel
    /// failures are not errors; they become state transitions.
    pub async fn execute(&self, notification: Notification) -> Result<DeliveryOutcome> {
        let current = match self.store.find_by_id(notification.id).await? {
            Some(stored) if stored.status == NotificationStatus::Sent => {
                debug!(notification_id = %stored.id, "already sent, skipping redelivery");
                return Ok(DeliveryOutcome::Skipped);
            },
            Some(stored) if stored.retry_count > notification.retry_count => {
                debug!(
                    notification_id = %stored.id,
                    stored_retry_count = stored.retry_count,
                    message_retry_count = notification.retry_count,
                    "stale message, skipping"
                );
                return Ok(DeliveryOutcome::Skipped);
            },
            Some(stored) => stored,
            None => notification,
        };

        let channel = self.registry.find(current.notification_type)?;
        self.stats.write().await.send_attempts += 1;

        match channel.send(&current).await {
            Ok(()) => self.on_sent(&current).await,
            Err(error) if error.is_delivery_failure() => self.on_failed(&current, &error).await,
            Err(error) => Err(error),
        }
    }

    async fn on_sent(&self, notification: &Notification) -> Result<DeliveryOutcome> {
        let sent = notification.sent(self.clock.now_utc());
        self.store.save(&sent).await?;

        self.stats.write().await.sent += 1;
        info!(
            notification_id = %sent.id,
            notification_type = %sent.notification_type,
            retry_count = sent.retry_count,
            "notification sent"
        );
        Ok(DeliveryOutcome::Sent)
    }

    async fn on_failed(
        &self,
        notification: &Notification,
        cause: &DeliveryError,
    ) -> Result<DeliveryOutcome> {
        let now = self.clock.now_utc();
        let failure = DeliveryFailure::new(cause.to_string(), cause.category().to_string());
        let next_count = notification.retry_count.saturating_add(1);

        match self.backoff.decide(notification.notification_type, next_count, now) {
            RetryDecision::Retry { next_retry_at } => {
                let failed = notification.retry_scheduled(&failure, next_retry_at, now);
                self.store.save_with_outbox(&failed, topics::RETRY).await?;

                self.stats.write().await.retries_scheduled += 1;
                warn!(
                    notification_id = %failed.id,
                    retry_count = failed.retry_count,
                    next_retry_at = %next_retry_at,
                    error = %cause,
                    "delivery failed, retry scheduled"
                );
                Ok(DeliveryOutcome::RetryScheduled { next_retry_at })
            },
            RetryDecision::GiveUp { reason } => {
                let dead = notification.dead_lettered(&failure, now);
                self.store.save_with_outbox(&dead, topics::DLQ).await?;

                self.stats.write().await.dead_lettered += 1;
                error!(
                    notification_id = %dead.id,
                    retry_count = dead.retry_count,
                    reason = %reason,
                    error = %cause,
                    "delivery failed permanently, notification dead-lettered"
                );
                Ok(DeliveryOutcome::DeadLettered)
            },
        }
    }
}

/// Retry use case: a delivery attempt gated on the scheduled retry time.
#[derive(Clone)]
pub struct RetryNotification {
    process: ProcessNotification,
    clock: Arc<dyn Clock>,
}

impl RetryNotification {
    /// Creates the use case.
    pub fn new(process: ProcessNotification, clock: Arc<dyn Clock>) -> Self {
        Self { process, clock }
    }

    /// Attempts delivery if the notification is due.
    ///
    /// Returns `false` without side effects if `next_retry_at` is still in
    /// the future.
    ///
    /// # Errors
    ///
    /// Propagates errors of the delivery attempt.
    pub async fn execute(&self, notification: Notification) -> Result<bool> {
        if notification.is_retry_pending(self.clock.now_utc()) {
            debug!(
                notification_id = %notification.id,
                next_retry_at = ?notification.next_retry_at,
                "retry not due yet"
            );
            return Ok(false);
        }

        self.process.execute(notification).await?;
        Ok(true)
    }
}
