//! Error types for the delivery pipeline.
//!
//! Every failure a use case or loop can observe is a `DeliveryError`. The
//! variant decides what happens next: delivery failures feed the retry state
//! machine, admission errors go back to the caller, and fatal errors stop the
//! loop that hit them.

use std::{fmt, time::Duration};

use notify_core::{CoreError, NotificationType};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions of the delivery pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Admission rejected by the rate limiter.
    #[error("rate limit exceeded for {key}")]
    RateLimited {
        /// Limiter dimension that rejected, e.g. `recipient:a@b.c`
        key: String,
    },

    /// Channel payload could not be parsed or failed validation.
    #[error("invalid payload: {message}")]
    InvalidPayload {
        /// What was wrong with the payload
        message: String,
    },

    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Error message describing the network failure
        message: String,
    },

    /// Downstream answered with a non-2xx status.
    #[error("unexpected HTTP status {status_code}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Channel call exceeded its time budget.
    #[error("channel call timed out after {timeout_ms}ms")]
    Timeout {
        /// Budget that was exceeded, in milliseconds
        timeout_ms: u64,
    },

    /// Circuit breaker is open, the channel was not called.
    #[error("circuit breaker open for channel {channel}")]
    CircuitOpen {
        /// Name of the channel whose breaker is open
        channel: String,
    },

    /// Channel-specific delivery failure.
    #[error("channel failure: {message}")]
    Channel {
        /// Error message reported by the channel
        message: String,
    },

    /// No registered channel supports the notification type.
    #[error("no channel registered for notification type {notification_type}")]
    NoChannel {
        /// Type without a channel
        notification_type: NotificationType,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Persistence operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Storage error message
        message: String,
    },

    /// Publishing to the message bus failed.
    #[error("failed to publish to {topic}: {message}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Publisher error message
        message: String,
    },

    /// An inbound message could not be decoded.
    #[error("failed to decode message: {message}")]
    Deserialization {
        /// Decoder error message
        message: String,
    },

    /// Stored data violates an assumption of the pipeline.
    #[error("data integrity violation: {message}")]
    Integrity {
        /// What was inconsistent
        message: String,
    },

    /// A supervised task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Index of the worker
        worker_id: usize,
        /// Panic description
        error: String,
    },

    /// Graceful shutdown did not finish in time.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured shutdown budget
        timeout: Duration,
    },
}

impl DeliveryError {
    /// Creates a rate limit error for a limiter key.
    pub fn rate_limited(key: impl Into<String>) -> Self {
        Self::RateLimited { key: key.into() }
    }

    /// Creates an invalid payload error.
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload { message: message.into() }
    }

    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX) }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(channel: impl Into<String>) -> Self {
        Self::CircuitOpen { channel: channel.into() }
    }

    /// Creates a generic channel failure.
    pub fn channel(message: impl Into<String>) -> Self {
        Self::Channel { message: message.into() }
    }

    /// Creates a missing channel error.
    pub fn no_channel(notification_type: NotificationType) -> Self {
        Self::NoChannel { notification_type }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a publish error.
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish { topic: topic.into(), message: message.into() }
    }

    /// Creates a deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization { message: message.into() }
    }

    /// Creates an integrity error.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity { message: message.into() }
    }

    /// Returns true for failures of a single delivery attempt.
    ///
    /// These never escape the delivery use case: they are recorded on the
    /// notification and drive the retry or dead-letter transition.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidPayload { .. }
                | Self::Network { .. }
                | Self::HttpStatus { .. }
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
                | Self::Channel { .. }
        )
    }

    /// Returns true for errors that must stop the loop that observed them.
    ///
    /// Missing channels and broken data invariants cannot be fixed by
    /// retrying the same message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoChannel { .. } | Self::Configuration { .. } | Self::Integrity { .. }
        )
    }

    /// Category persisted on the notification and used in logs.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::storage(error.to_string())
    }
}

/// Category of a pipeline error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// A delivery attempt failed.
    Delivery,
    /// Intake was rejected.
    Admission,
    /// Wiring or settings are wrong.
    Configuration,
    /// Persistence failed.
    Storage,
    /// The message bus failed or delivered garbage.
    Messaging,
    /// Stored data is inconsistent.
    Integrity,
    /// Task supervision problems.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::InvalidPayload { .. }
            | DeliveryError::Network { .. }
            | DeliveryError::HttpStatus { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::CircuitOpen { .. }
            | DeliveryError::Channel { .. } => Self::Delivery,
            DeliveryError::RateLimited { .. } => Self::Admission,
            DeliveryError::NoChannel { .. } | DeliveryError::Configuration { .. } => {
                Self::Configuration
            },
            DeliveryError::Storage { .. } => Self::Storage,
            DeliveryError::Publish { .. } | DeliveryError::Deserialization { .. } => {
                Self::Messaging
            },
            DeliveryError::Integrity { .. } => Self::Integrity,
            DeliveryError::WorkerPanic { .. } | DeliveryError::ShutdownTimeout { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivery => write!(f, "DELIVERY"),
            Self::Admission => write!(f, "ADMISSION"),
            Self::Configuration => write!(f, "CONFIGURATION"),
            Self::Storage => write!(f, "STORAGE"),
            Self::Messaging => write!(f, "MESSAGING"),
            Self::Integrity => write!(f, "INTEGRITY"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_failures_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_delivery_failure());
        assert!(DeliveryError::timeout(Duration::from_secs(10)).is_delivery_failure());
        assert!(DeliveryError::http_status(503, "unavailable").is_delivery_failure());
        assert!(DeliveryError::circuit_open("email").is_delivery_failure());
        assert!(DeliveryError::invalid_payload("subject is blank").is_delivery_failure());

        assert!(!DeliveryError::rate_limited("client:c1").is_delivery_failure());
        assert!(!DeliveryError::storage("connection lost").is_delivery_failure());
        assert!(!DeliveryError::no_channel(NotificationType::Email).is_delivery_failure());
    }

    #[test]
    fn fatal_errors_identified_correctly() {
        assert!(DeliveryError::no_channel(NotificationType::Webhook).is_fatal());
        assert!(DeliveryError::integrity("outbox references missing row").is_fatal());
        assert!(DeliveryError::configuration("empty registry").is_fatal());

        assert!(!DeliveryError::storage("timeout").is_fatal());
        assert!(!DeliveryError::publish("echo.notify.send", "down").is_fatal());
        assert!(!DeliveryError::network("reset").is_fatal());
    }

    #[test]
    fn error_categories_mapped_correctly() {
        assert_eq!(DeliveryError::network("x").category(), ErrorCategory::Delivery);
        assert_eq!(DeliveryError::rate_limited("type:EMAIL").category(), ErrorCategory::Admission);
        assert_eq!(
            DeliveryError::no_channel(NotificationType::Email).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(DeliveryError::deserialization("eof").category(), ErrorCategory::Messaging);
        assert_eq!(ErrorCategory::Delivery.to_string(), "DELIVERY");
    }

    #[test]
    fn core_errors_become_storage_errors() {
        let error = DeliveryError::from(CoreError::Database("pool closed".to_string()));
        assert!(matches!(error, DeliveryError::Storage { .. }));
        assert_eq!(error.category(), ErrorCategory::Storage);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(
            DeliveryError::timeout(Duration::from_millis(1500)).to_string(),
            "channel call timed out after 1500ms"
        );
        assert_eq!(
            DeliveryError::circuit_open("webhook").to_string(),
            "circuit breaker open for channel webhook"
        );
    }
}
