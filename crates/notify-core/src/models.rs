//! Core domain models and strongly-typed identifiers.
//!
//! Defines notifications, outbox events, and newtype ID wrappers for
//! compile-time type safety. Includes database serialization traits and the
//! state transitions of the delivery state machine.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Strongly-typed notification identifier.
///
/// Assigned once at intake and never changed. The same id travels with the
/// notification through the outbox, the bus, retries and the dead-letter
/// topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub Uuid);

impl NotificationId {
    /// Creates a new random notification ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for NotificationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for NotificationId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for NotificationId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed outbox event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxEventId(pub Uuid);

impl OutboxEventId {
    /// Creates a new random outbox event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OutboxEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OutboxEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for OutboxEventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for OutboxEventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OutboxEventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for OutboxEventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery mechanism a notification is routed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    /// Delivered by the email relay.
    Email,
    /// Delivered as an HTTP POST to a caller-supplied URL.
    Webhook,
}

impl NotificationType {
    /// Every supported type, in declaration order.
    pub const ALL: [Self; 2] = [Self::Email, Self::Webhook];

    /// Wire and database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Webhook => "WEBHOOK",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMAIL" => Ok(Self::Email),
            "WEBHOOK" => Ok(Self::Webhook),
            _ => Err(CoreError::InvalidInput(format!("invalid notification type: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for NotificationType {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationType {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Delivery lifecycle of a notification.
///
/// ```text
/// PENDING ──► SENT
///    │
///    └──► FAILED ──► (retry) ──► SENT | FAILED | DEAD_LETTERED
/// ```
///
/// `SENT` and `DEAD_LETTERED` are terminal for the automatic pipeline. A
/// dead-lettered notification only moves again when an operator reprocesses
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    /// Accepted at intake, not yet attempted.
    Pending,
    /// Delivered successfully.
    Sent,
    /// Last attempt failed; a retry is scheduled at `next_retry_at`.
    Failed,
    /// Attempt ceiling reached; parked until reprocessed.
    DeadLettered,
}

impl NotificationStatus {
    /// Wire and database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::DeadLettered => "DEAD_LETTERED",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            "DEAD_LETTERED" => Ok(Self::DeadLettered),
            _ => Err(CoreError::InvalidInput(format!("invalid notification status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for NotificationStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for NotificationStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Publication state of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting to be published (possibly after a failed attempt).
    Pending,
    /// Published to the bus. Terminal.
    Published,
    /// Reserved for operator intervention; the poller never selects it.
    Failed,
}

impl OutboxStatus {
    /// Wire and database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PUBLISHED" => Ok(Self::Published),
            "FAILED" => Ok(Self::Failed),
            _ => Err(CoreError::InvalidInput(format!("invalid outbox status: {s}"))),
        }
    }
}

impl sqlx::Type<PgDb> for OutboxStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for OutboxStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Error codes persisted on failed notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Attempt failed and another one is scheduled.
    DeliveryFailedRetryable,
    /// Attempt failed and the attempt ceiling was reached.
    DeliveryFailedMaxAttempts,
}

impl ErrorCode {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeliveryFailedRetryable => "DELIVERY_FAILED_RETRYABLE",
            Self::DeliveryFailedMaxAttempts => "DELIVERY_FAILED_MAX_ATTEMPTS",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics of a failed delivery attempt, recorded on the notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Human-readable cause.
    pub message: String,
    /// Failure category, e.g. `DELIVERY`.
    pub category: String,
}

impl DeliveryFailure {
    /// Creates a failure record.
    pub fn new(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self { message: message.into(), category: category.into() }
    }
}

/// The unit of work flowing through the pipeline.
///
/// Mutations never happen in place: each transition returns an updated copy
/// so callers persist exactly the state they decided on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    /// Unique identifier.
    pub id: NotificationId,

    /// Delivery mechanism.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub notification_type: NotificationType,

    /// Addressee, e.g. an email address.
    pub recipient: String,

    /// Caller that owns the notification.
    pub client_id: String,

    /// Channel-specific content, opaque to the pipeline.
    pub payload: String,

    /// Caller-supplied deduplication token. Unique across notifications.
    pub idempotency_key: String,

    /// Current lifecycle state.
    pub status: NotificationStatus,

    /// Failed attempts so far. Only ever increases.
    #[sqlx(try_from = "i32")]
    pub retry_count: u32,

    /// Cause of the last failure.
    pub error_message: Option<String>,

    /// Code of the last failure.
    pub error_code: Option<String>,

    /// Category of the last failure.
    pub error_category: Option<String>,

    /// Whether the last failure will be retried.
    pub retryable: Option<bool>,

    /// Scheduled redelivery time. Set only while `FAILED`.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Creation time. Immutable.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Creates a fresh `PENDING` notification with no failure history.
    pub fn new(
        notification_type: NotificationType,
        recipient: impl Into<String>,
        client_id: impl Into<String>,
        payload: impl Into<String>,
        idempotency_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            notification_type,
            recipient: recipient.into(),
            client_id: client_id.into(),
            payload: payload.into(),
            idempotency_key: idempotency_key.into(),
            status: NotificationStatus::Pending,
            retry_count: 0,
            error_message: None,
            error_code: None,
            error_category: None,
            retryable: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the notification marked `SENT` with all diagnostics cleared.
    pub fn sent(&self, now: DateTime<Utc>) -> Self {
        Self {
            status: NotificationStatus::Sent,
            error_message: None,
            error_code: None,
            error_category: None,
            retryable: None,
            next_retry_at: None,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Returns the notification marked `FAILED` with a retry scheduled.
    ///
    /// Increments `retry_count` by exactly one.
    pub fn retry_scheduled(
        &self,
        failure: &DeliveryFailure,
        next_retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: NotificationStatus::Failed,
            retry_count: self.retry_count.saturating_add(1),
            error_message: Some(failure.message.clone()),
            error_code: Some(ErrorCode::DeliveryFailedRetryable.to_string()),
            error_category: Some(failure.category.clone()),
            retryable: Some(true),
            next_retry_at: Some(next_retry_at),
            updated_at: now,
            ..self.clone()
        }
    }

    /// Returns the notification marked `DEAD_LETTERED`.
    ///
    /// Increments `retry_count` by exactly one and clears `next_retry_at`.
    pub fn dead_lettered(&self, failure: &DeliveryFailure, now: DateTime<Utc>) -> Self {
        Self {
            status: NotificationStatus::DeadLettered,
            retry_count: self.retry_count.saturating_add(1),
            error_message: Some(failure.message.clone()),
            error_code: Some(ErrorCode::DeliveryFailedMaxAttempts.to_string()),
            error_category: Some(failure.category.clone()),
            retryable: Some(false),
            next_retry_at: None,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Returns true if the notification carries no failure diagnostics.
    pub fn is_clean(&self) -> bool {
        self.error_message.is_none()
            && self.error_code.is_none()
            && self.error_category.is_none()
            && self.retryable.is_none()
            && self.next_retry_at.is_none()
    }

    /// Returns true if the scheduled retry time is still ahead of `now`.
    pub fn is_retry_pending(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_some_and(|at| at > now)
    }
}

/// A durable intent to publish a notification to a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
    /// Unique identifier.
    pub id: OutboxEventId,

    /// Notification to publish.
    pub notification_id: NotificationId,

    /// Destination topic.
    pub topic: String,

    /// Publication state.
    pub status: OutboxStatus,

    /// Failed publish attempts.
    #[sqlx(try_from = "i32")]
    pub attempts: u32,

    /// Error of the last failed publish.
    pub last_error: Option<String>,

    /// Earliest time the poller may pick the event up.
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Creates a `PENDING` event due immediately.
    pub fn pending(
        notification_id: NotificationId,
        topic: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OutboxEventId::new(),
            notification_id,
            topic: topic.into(),
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the poller should publish the event at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}
