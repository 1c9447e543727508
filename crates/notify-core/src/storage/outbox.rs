//! Repository for outbox events.
//!
//! Rows are inserted only inside the transaction that writes the
//! notification they announce. The poller afterwards moves them forward:
//! `PENDING` to `PUBLISHED`, or `PENDING` again with one more attempt and a
//! later due time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{OutboxEvent, OutboxEventId, OutboxStatus},
};

/// Repository for outbox database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts an outbox event within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the referenced
    /// notification does not exist.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> Result<()> {
        self.insert_impl(&mut **tx, event).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, event: &OutboxEvent) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO notification_outbox (
                id, notification_id, topic, status, attempts, last_error,
                next_attempt_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.notification_id)
        .bind(&event.topic)
        .bind(event.status.as_str())
        .bind(i32::try_from(event.attempts).unwrap_or(i32::MAX))
        .bind(&event.last_error)
        .bind(event.next_attempt_at)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Fetches up to `limit` pending events that are due at `now`, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn fetch_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEvent>> {
        let events = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, notification_id, topic, status, attempts, last_error,
                   next_attempt_at, created_at, updated_at
            FROM notification_outbox
            WHERE status = $1
              AND (next_attempt_at IS NULL OR next_attempt_at <= $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(OutboxStatus::Pending.as_str())
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Marks an event as published. Terminal.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no pending event has this id.
    pub async fn mark_published(&self, id: OutboxEventId, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET status = $1, last_error = NULL, updated_at = $2
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(OutboxStatus::Published.as_str())
        .bind(now)
        .bind(id)
        .bind(OutboxStatus::Pending.as_str())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("pending outbox event {id}")));
        }

        Ok(())
    }

    /// Records a failed publish: the event stays `PENDING`, `attempts` grows
    /// by one and the event becomes due again at `next_attempt_at`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no pending event has this id.
    pub async fn mark_failed(
        &self,
        id: OutboxEventId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE notification_outbox
            SET attempts = attempts + 1,
                last_error = $1,
                next_attempt_at = $2,
                updated_at = $3
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .bind(id)
        .bind(OutboxStatus::Pending.as_str())
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("pending outbox event {id}")));
        }

        Ok(())
    }

    /// Deletes `PUBLISHED` events last updated before `cutoff` and returns
    /// how many were removed. Pending events are never deleted.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM notification_outbox WHERE status = $1 AND updated_at < $2")
                .bind(OutboxStatus::Published.as_str())
                .bind(cutoff)
                .execute(&*self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
