//! Idempotent intake of notification requests.
//!
//! A submission runs under the lock of its idempotency key. The first
//! submission passes admission control and is stored together with an outbox
//! event for the send topic. Any later submission with the same key returns
//! the stored notification untouched and writes nothing.

use std::sync::Arc;

use notify_core::{topics, Clock, Notification, NotificationType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    error::{DeliveryError, Result},
    idempotency::IdempotencyLock,
    rate_limit::RateLimiter,
    storage::NotificationStore,
};

/// A request to send a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotification {
    /// Delivery mechanism.
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    /// Addressee.
    pub recipient: String,
    /// Owning caller.
    pub client_id: String,
    /// Channel-specific content.
    pub payload: String,
    /// Caller-supplied deduplication token.
    pub idempotency_key: String,
}

impl CreateNotification {
    /// Limiter keys checked at admission, in order.
    pub fn admission_keys(&self) -> [String; 3] {
        [
            format!("type:{}", self.notification_type),
            format!("recipient:{}", self.recipient),
            format!("client:{}", self.client_id),
        ]
    }
}

/// Intake use case.
pub struct SendNotification {
    store: Arc<dyn NotificationStore>,
    limiter: Arc<RateLimiter>,
    lock: Arc<IdempotencyLock>,
    clock: Arc<dyn Clock>,
}

impl SendNotification {
    /// Creates the use case.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        limiter: Arc<RateLimiter>,
        lock: Arc<IdempotencyLock>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, limiter, lock, clock }
    }

    /// Accepts a request, returning the stored notification.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::RateLimited` if any admission dimension is
    /// exhausted, or `DeliveryError::Storage` if the lookup or write fails.
    /// Nothing is persisted in either case.
    pub async fn execute(&self, request: CreateNotification) -> Result<Notification> {
        let key = request.idempotency_key.clone();
        self.lock.with_lock(&key, || self.admit(request)).await
    }

    async fn admit(&self, request: CreateNotification) -> Result<Notification> {
        if let Some(existing) =
            self.store.find_by_idempotency_key(&request.idempotency_key).await?
        {
            debug!(
                notification_id = %existing.id,
                idempotency_key = %request.idempotency_key,
                "duplicate submission, returning stored notification"
            );
            return Ok(existing);
        }

        for key in request.admission_keys() {
            if !self.limiter.try_acquire(&key) {
                warn!(limiter_key = %key, "notification rejected by rate limiter");
                return Err(DeliveryError::rate_limited(key));
            }
        }

        let notification = Notification::new(
            request.notification_type,
            request.recipient,
            request.client_id,
            request.payload,
            request.idempotency_key,
            self.clock.now_utc(),
        );
        self.store.save_with_outbox(&notification, topics::SEND).await?;

        info!(
            notification_id = %notification.id,
            notification_type = %notification.notification_type,
            "notification accepted"
        );
        Ok(notification)
    }
}
