//! Table and index definitions for the pipeline.
//!
//! Every statement is idempotent, so [`ensure_schema`] runs on each startup.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS notifications (
        id UUID PRIMARY KEY,
        type TEXT NOT NULL,
        recipient TEXT NOT NULL,
        client_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        error_code TEXT,
        error_category TEXT,
        retryable BOOLEAN,
        next_retry_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS notification_outbox (
        id UUID PRIMARY KEY,
        notification_id UUID NOT NULL REFERENCES notifications(id),
        topic TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_messages (
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        message_offset BIGINT NOT NULL,
        message_key TEXT,
        payload BYTEA NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (topic, partition_id, message_offset)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_log_heads (
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        next_offset BIGINT NOT NULL,
        PRIMARY KEY (topic, partition_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bus_offsets (
        consumer_group TEXT NOT NULL,
        topic TEXT NOT NULL,
        partition_id INTEGER NOT NULL,
        next_offset BIGINT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (consumer_group, topic, partition_id)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notifications_status
    ON notifications(status, updated_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_notification_outbox_due
    ON notification_outbox(status, next_attempt_at)
    "#,
];

/// Creates the pipeline tables and indexes if they are missing.
///
/// # Errors
///
/// Returns `CoreError::Database` for the first statement that fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
