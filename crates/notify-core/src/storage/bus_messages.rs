//! Repository for the append-only message log backing the bus.
//!
//! Every topic is a single partition (0). Offsets are handed out from a
//! per-partition head row in `bus_log_heads`. Claiming an offset locks that
//! row until the appending transaction ends, so appends to one partition are
//! serialized and become visible in offset order. A consumer that has read
//! offset `n` can never later observe a smaller offset appearing behind it.
//!
//! Consumer groups keep their position in `bus_offsets` as the next offset to
//! read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;

/// The only partition used by the log.
pub const DEFAULT_PARTITION: i32 = 0;

/// A message as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredMessage {
    /// Topic the message was appended to.
    pub topic: String,

    /// Partition within the topic.
    pub partition_id: i32,

    /// Position within the partition.
    pub message_offset: i64,

    /// Routing key, usually the notification id.
    pub message_key: Option<String>,

    /// Raw payload bytes.
    pub payload: Vec<u8>,

    /// Append time.
    pub created_at: DateTime<Utc>,
}

/// Repository for message log operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends a message in its own transaction and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn append(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let offset = self.append_in_tx(&mut tx, topic, key, payload, now).await?;
        tx.commit().await?;

        Ok(offset)
    }

    /// Appends a message within a transaction and returns its offset.
    ///
    /// Other appends to the same topic block until `tx` ends.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let offset: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO bus_log_heads (topic, partition_id, next_offset)
            VALUES ($1, $2, 1)
            ON CONFLICT (topic, partition_id) DO UPDATE SET
                next_offset = bus_log_heads.next_offset + 1
            RETURNING next_offset - 1
            "#,
        )
        .bind(topic)
        .bind(DEFAULT_PARTITION)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO bus_messages
                (topic, partition_id, message_offset, message_key, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(topic)
        .bind(DEFAULT_PARTITION)
        .bind(offset)
        .bind(key)
        .bind(payload)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(offset)
    }

    /// Reads up to `max` messages of `topic` starting at the group's
    /// committed position.
    ///
    /// Reading does not move the position; uncommitted messages are returned
    /// again on the next call.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn fetch_from_cursor(
        &self,
        consumer_group: &str,
        topic: &str,
        max: usize,
    ) -> Result<Vec<StoredMessage>> {
        let messages = sqlx::query_as::<_, StoredMessage>(
            r#"
            SELECT m.topic, m.partition_id, m.message_offset, m.message_key, m.payload, m.created_at
            FROM bus_messages m
            WHERE m.topic = $1
              AND m.partition_id = $2
              AND m.message_offset >= COALESCE(
                  (SELECT o.next_offset FROM bus_offsets o
                   WHERE o.consumer_group = $3 AND o.topic = $1 AND o.partition_id = $2),
                  0)
            ORDER BY m.message_offset ASC
            LIMIT $4
            "#,
        )
        .bind(topic)
        .bind(DEFAULT_PARTITION)
        .bind(consumer_group)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        Ok(messages)
    }

    /// Moves the group's position to `next_offset`. The position never moves
    /// backwards.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn commit(
        &self,
        consumer_group: &str,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bus_offsets (consumer_group, topic, partition_id, next_offset, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (consumer_group, topic, partition_id) DO UPDATE SET
                next_offset = GREATEST(bus_offsets.next_offset, EXCLUDED.next_offset),
                updated_at = NOW()
            "#,
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(partition)
        .bind(next_offset)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Deletes messages of `topic` appended before `cutoff` that every
    /// consumer group with a committed position has already read.
    ///
    /// Returns the number of deleted messages. Nothing is deleted while no
    /// group has committed on the topic. Offsets are never reused because the
    /// partition head is kept.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn delete_consumed(&self, topic: &str, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM bus_messages m
            WHERE m.topic = $1
              AND m.partition_id = $2
              AND m.created_at < $3
              AND m.message_offset < (
                  SELECT COALESCE(MIN(o.next_offset), 0) FROM bus_offsets o
                  WHERE o.topic = $1 AND o.partition_id = $2)
            "#,
        )
        .bind(topic)
        .bind(DEFAULT_PARTITION)
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
