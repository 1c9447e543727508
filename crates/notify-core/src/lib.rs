//! Core domain model for the notification delivery pipeline.
//!
//! Holds the notification and outbox entities, the wire messages exchanged on
//! the bus, the clock abstraction used for deterministic timing, and the
//! PostgreSQL repositories that persist all of it. The delivery crate builds
//! the pipeline on top of these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod messages;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use messages::{topics, DlqErrorMessage, NotificationMessage, NotificationRecord};
pub use models::{
    DeliveryFailure, ErrorCode, Notification, NotificationId, NotificationStatus,
    NotificationType, OutboxEvent, OutboxEventId, OutboxStatus,
};
pub use time::{Clock, RealClock, TestClock};
