//! Email channel.
//!
//! Validates the email payload and hands accepted mail to the relay log.
//! No SMTP transport is attached; the relay is whatever consumes that log.

use async_trait::async_trait;
use notify_core::{Notification, NotificationType};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    channel::NotificationChannel,
    error::{DeliveryError, Result},
};

/// Payload of an `EMAIL` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Subject line. Must not be blank.
    pub subject: String,
    /// Message body. Must not be blank.
    pub body: String,
    /// Sender address.
    pub from: String,
}

impl EmailPayload {
    /// Parses and validates a payload.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidPayload` for malformed JSON or a blank
    /// subject or body.
    pub fn parse(raw: &str) -> Result<Self> {
        let payload: Self = serde_json::from_str(raw)
            .map_err(|e| DeliveryError::invalid_payload(format!("email payload: {e}")))?;

        if payload.subject.trim().is_empty() {
            return Err(DeliveryError::invalid_payload("Email subject is required"));
        }
        if payload.body.trim().is_empty() {
            return Err(DeliveryError::invalid_payload("Email body is required"));
        }

        Ok(payload)
    }
}

/// Channel for `EMAIL` notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailChannel;

impl EmailChannel {
    /// Creates the channel.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    fn supports(&self, notification_type: NotificationType) -> bool {
        notification_type == NotificationType::Email
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = EmailPayload::parse(&notification.payload)?;

        info!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            from = %payload.from,
            subject = %payload.subject,
            "email handed to relay"
        );

        Ok(())
    }
}
