//! Operator-triggered dead-letter reprocessing and status queries.

use std::sync::Arc;

use notify_core::{topics, Notification, NotificationId, NotificationStatus};
use tracing::info;

use crate::{bus::NotificationPublisher, error::Result, storage::NotificationStore};

/// Republishes dead-lettered notifications to the send topic.
///
/// The notifications keep their `DEAD_LETTERED` status until the delivery
/// use case runs for them again.
pub struct ReprocessDeadLetters {
    store: Arc<dyn NotificationStore>,
    publisher: NotificationPublisher,
}

impl ReprocessDeadLetters {
    /// Creates the use case.
    pub fn new(store: Arc<dyn NotificationStore>, publisher: NotificationPublisher) -> Self {
        Self { store, publisher }
    }

    /// Republishes up to `limit` dead-lettered notifications and returns
    /// their ids.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the lookup fails or
    /// `DeliveryError::Publish` on the first publish failure. Notifications
    /// published before the failure stay published.
    pub async fn execute(&self, limit: usize) -> Result<Vec<NotificationId>> {
        let dead = self.store.find_by_status(NotificationStatus::DeadLettered, limit).await?;

        let mut republished = Vec::with_capacity(dead.len());
        for notification in &dead {
            self.publisher.publish(topics::SEND, notification).await?;
            republished.push(notification.id);
        }

        info!(count = republished.len(), limit, "dead-lettered notifications republished");
        Ok(republished)
    }
}

/// Read-only access to notification state.
pub struct QueryNotificationStatus {
    store: Arc<dyn NotificationStore>,
}

impl QueryNotificationStatus {
    /// Creates the use case.
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Current state of one notification.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the lookup fails.
    pub async fn execute(&self, id: NotificationId) -> Result<Option<Notification>> {
        Ok(self.store.find_by_id(id).await?)
    }

    /// Current state of every existing notification among `ids`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Storage` if the lookup fails.
    pub async fn execute_many(&self, ids: Vec<NotificationId>) -> Result<Vec<Notification>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.store.find_by_ids(ids).await?)
    }
}
