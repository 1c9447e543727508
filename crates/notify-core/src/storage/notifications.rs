//! Repository for notification rows.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Notification, NotificationId, NotificationStatus},
};

const SELECT_COLUMNS: &str = r#"
    SELECT id, type, recipient, client_id, payload, idempotency_key, status,
           retry_count, error_message, error_code, error_category, retryable,
           next_retry_at, created_at, updated_at
    FROM notifications
"#;

/// Repository for notification database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a notification or overwrites the mutable state of an existing
    /// one.
    ///
    /// `created_at`, identity and addressing columns are never rewritten.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the idempotency key
    /// belongs to another notification.
    pub async fn upsert(&self, notification: &Notification) -> Result<()> {
        self.upsert_impl(&*self.pool, notification).await
    }

    /// Upserts a notification within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub async fn upsert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        notification: &Notification,
    ) -> Result<()> {
        self.upsert_impl(&mut **tx, notification).await
    }

    async fn upsert_impl<'e, E>(&self, executor: E, notification: &Notification) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, type, recipient, client_id, payload, idempotency_key, status,
                retry_count, error_message, error_code, error_category, retryable,
                next_retry_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            )
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                retry_count = EXCLUDED.retry_count,
                error_message = EXCLUDED.error_message,
                error_code = EXCLUDED.error_code,
                error_category = EXCLUDED.error_category,
                retryable = EXCLUDED.retryable,
                next_retry_at = EXCLUDED.next_retry_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(notification.id)
        .bind(notification.notification_type.as_str())
        .bind(&notification.recipient)
        .bind(&notification.client_id)
        .bind(&notification.payload)
        .bind(&notification.idempotency_key)
        .bind(notification.status.as_str())
        .bind(i32::try_from(notification.retry_count).unwrap_or(i32::MAX))
        .bind(&notification.error_message)
        .bind(&notification.error_code)
        .bind(&notification.error_category)
        .bind(notification.retryable)
        .bind(notification.next_retry_at)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Finds a notification by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: NotificationId) -> Result<Option<Notification>> {
        let notification =
            sqlx::query_as::<_, Notification>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(notification)
    }

    /// Finds every notification whose id is in `ids`. Missing ids are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_ids(&self, ids: &[NotificationId]) -> Result<Vec<Notification>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let notifications = sqlx::query_as::<_, Notification>(&format!(
            "{SELECT_COLUMNS} WHERE id = ANY($1) ORDER BY created_at ASC"
        ))
        .bind(&raw)
        .fetch_all(&*self.pool)
        .await?;

        Ok(notifications)
    }

    /// Finds the notification registered under an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Notification>> {
        let notification = sqlx::query_as::<_, Notification>(&format!(
            "{SELECT_COLUMNS} WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(notification)
    }

    /// Lists up to `limit` notifications in the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(
        &self,
        status: NotificationStatus,
        limit: usize,
    ) -> Result<Vec<Notification>> {
        let notifications = sqlx::query_as::<_, Notification>(&format!(
            "{SELECT_COLUMNS} WHERE status = $1 ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(notifications)
    }
}
