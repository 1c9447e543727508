//! Database access layer for notifications, the outbox and the message log.
//!
//! Repositories translate between domain models and rows. Operations that
//! must commit together (a notification transition plus the outbox event that
//! announces it) go through [`Storage::save_with_outbox`], which runs both
//! writes in one transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod bus_messages;
pub mod notifications;
pub mod outbox;
pub mod schema;

use crate::{
    error::Result,
    models::{Notification, OutboxEvent},
};

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Repository for notification rows.
    pub notifications: Arc<notifications::Repository>,

    /// Repository for outbox events.
    pub outbox: Arc<outbox::Repository>,

    /// Repository for the append-only message log and consumer cursors.
    pub bus_messages: Arc<bus_messages::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            notifications: Arc::new(notifications::Repository::new(pool.clone())),
            outbox: Arc::new(outbox::Repository::new(pool.clone())),
            bus_messages: Arc::new(bus_messages::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Upserts a notification and inserts a new `PENDING` outbox event for it
    /// in a single transaction.
    ///
    /// The outbox event is due at `now` with zero attempts. Either both rows
    /// are written or neither is.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the idempotency key is
    /// already taken by a different notification, or `CoreError::Database`
    /// if the transaction fails.
    pub async fn save_with_outbox(
        &self,
        notification: &Notification,
        topic: &str,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent> {
        let event = OutboxEvent::pending(notification.id, topic, now);

        let mut tx = self.pool.begin().await?;
        self.notifications.upsert_in_tx(&mut tx, notification).await?;
        self.outbox.insert_in_tx(&mut tx, &event).await?;
        tx.commit().await?;

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);
        assert_eq!(Arc::strong_count(&storage.pool), 4);
    }
}
