//! Wire messages exchanged on the message bus.
//!
//! Notifications travel inside a [`NotificationMessage`] envelope on the send
//! and retry topics. Inbound records that cannot be decoded are reported on the
//! dead-letter topic as a [`DlqErrorMessage`] carrying full provenance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    models::{Notification, NotificationId, NotificationStatus, NotificationType},
};

/// Topic names used by the pipeline.
pub mod topics {
    /// New and reprocessed notifications awaiting a delivery attempt.
    pub const SEND: &str = "echo.notify.send";

    /// Notifications awaiting a scheduled redelivery.
    pub const RETRY: &str = "echo.notify.retry";

    /// Terminal failures and undecodable inbound records.
    pub const DLQ: &str = "echo.notify.dlq";

    /// All pipeline topics.
    pub const ALL: [&str; 3] = [SEND, RETRY, DLQ];
}

/// Event type carried by every notification envelope.
pub const NOTIFICATION_EVENT_TYPE: &str = "NOTIFICATION";

/// Reason reported for records that failed to decode.
pub const DESERIALIZATION_ERROR: &str = "DESERIALIZATION_ERROR";

/// Envelope published to the send, retry and dlq topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    /// Always `NOTIFICATION`.
    pub event_type: String,

    /// Snapshot of the notification at publish time.
    pub notification: NotificationRecord,

    /// Publish time in epoch milliseconds.
    pub timestamp: i64,
}

impl NotificationMessage {
    /// Wraps a notification snapshot taken at `now`.
    pub fn new(notification: &Notification, now: DateTime<Utc>) -> Self {
        Self {
            event_type: NOTIFICATION_EVENT_TYPE.to_string(),
            notification: NotificationRecord::from(notification),
            timestamp: now.timestamp_millis(),
        }
    }

    /// Decodes a message from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the bytes are not a valid
    /// envelope. Unknown fields are ignored.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encodes the message as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Notification as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    /// Notification id.
    pub id: NotificationId,

    /// Delivery mechanism.
    #[serde(rename = "type")]
    pub notification_type: NotificationType,

    /// Addressee.
    pub recipient: String,

    /// Owning caller.
    pub client_id: String,

    /// Channel-specific content.
    pub payload: String,

    /// Deduplication token.
    pub idempotency_key: String,

    /// Lifecycle state.
    pub status: NotificationStatus,

    /// Failed attempts so far.
    pub retry_count: u32,

    /// Cause of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Code of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Category of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,

    /// Whether the last failure will be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,

    /// Scheduled redelivery time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl From<&Notification> for NotificationRecord {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id,
            notification_type: n.notification_type,
            recipient: n.recipient.clone(),
            client_id: n.client_id.clone(),
            payload: n.payload.clone(),
            idempotency_key: n.idempotency_key.clone(),
            status: n.status,
            retry_count: n.retry_count,
            error_message: n.error_message.clone(),
            error_code: n.error_code.clone(),
            error_category: n.error_category.clone(),
            retryable: n.retryable,
            next_retry_at: n.next_retry_at,
            created_at: n.created_at,
            updated_at: n.updated_at,
        }
    }
}

impl From<NotificationRecord> for Notification {
    fn from(r: NotificationRecord) -> Self {
        Self {
            id: r.id,
            notification_type: r.notification_type,
            recipient: r.recipient,
            client_id: r.client_id,
            payload: r.payload,
            idempotency_key: r.idempotency_key,
            status: r.status,
            retry_count: r.retry_count,
            error_message: r.error_message,
            error_code: r.error_code,
            error_category: r.error_category,
            retryable: r.retryable,
            next_retry_at: r.next_retry_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Report published to the dlq topic for an inbound record that could not
/// be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqErrorMessage {
    /// Always `DESERIALIZATION_ERROR`.
    pub reason: String,

    /// Topic the record was read from.
    pub source_topic: String,

    /// Partition the record was read from.
    pub source_partition: i32,

    /// Offset of the record.
    pub source_offset: i64,

    /// Raw payload, lossily decoded as UTF-8.
    pub raw_payload: String,

    /// Report time in epoch milliseconds.
    pub timestamp: i64,
}

impl DlqErrorMessage {
    /// Builds a deserialization report for the given record coordinates.
    pub fn deserialization(
        source_topic: impl Into<String>,
        source_partition: i32,
        source_offset: i64,
        raw_payload: &[u8],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            reason: DESERIALIZATION_ERROR.to_string(),
            source_topic: source_topic.into(),
            source_partition,
            source_offset,
            raw_payload: String::from_utf8_lossy(raw_payload).into_owned(),
            timestamp: now.timestamp_millis(),
        }
    }

    /// Encodes the report as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
