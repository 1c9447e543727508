//! Webhook channel.
//!
//! POSTs the payload body as JSON to the URL carried in the payload and
//! requires a 2xx answer. Errors are categorized like the rest of the
//! pipeline: connect failures are `Network`, client timeouts are `Timeout`
//! and non-2xx responses are `HttpStatus`.

use std::time::Duration;

use async_trait::async_trait;
use notify_core::{Notification, NotificationType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    channel::NotificationChannel,
    error::{DeliveryError, Result},
};

/// Largest response body kept in an error.
const MAX_ERROR_BODY: usize = 1024;

/// HTTP client settings for the webhook channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Request timeout enforced by the HTTP client.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), user_agent: "echo-notify/0.1".to_string() }
    }
}

/// Payload of a `WEBHOOK` notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Destination URL.
    pub url: String,
    /// Request body, sent verbatim as `application/json`.
    pub body: String,
}

impl WebhookPayload {
    /// Parses a payload.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidPayload` for malformed JSON or a blank
    /// URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let payload: Self = serde_json::from_str(raw)
            .map_err(|e| DeliveryError::invalid_payload(format!("webhook payload: {e}")))?;

        if payload.url.trim().is_empty() {
            return Err(DeliveryError::invalid_payload("Webhook url is required"));
        }

        Ok(payload)
    }
}

/// Channel for `WEBHOOK` notifications.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookChannel {
    /// Creates a channel with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    fn supports(&self, notification_type: NotificationType) -> bool {
        notification_type == NotificationType::Webhook
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload::parse(&notification.payload)?;

        let span = info_span!(
            "webhook_delivery",
            notification_id = %notification.id,
            url = %payload.url,
            attempt = notification.retry_count + 1
        );

        async move {
            let response = self
                .client
                .post(&payload.url)
                .header("content-type", "application/json")
                .body(payload.body)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "webhook request failed");
                    if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout)
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    }
                })?;

            let status = response.status();
            if status.is_success() {
                debug!(status = status.as_u16(), "webhook delivered");
                return Ok(());
            }

            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            warn!(status = status.as_u16(), "webhook answered with non-2xx status");
            Err(DeliveryError::http_status(status.as_u16(), body))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_payload() {
        let payload = WebhookPayload::parse(r#"{"url":"http://h/x","body":"{\"a\":1}"}"#).unwrap();
        assert_eq!(payload.url, "http://h/x");
        assert_eq!(payload.body, r#"{"a":1}"#);
    }

    #[test]
    fn rejects_missing_fields_and_blank_url() {
        assert!(WebhookPayload::parse(r#"{"url":"http://h/x"}"#).is_err());
        assert!(WebhookPayload::parse(r#"{"url":" ","body":"{}"}"#).is_err());
    }

    #[test]
    fn supports_only_webhook() {
        let channel = WebhookChannel::new(WebhookConfig::default()).unwrap();
        assert!(channel.supports(NotificationType::Webhook));
        assert!(!channel.supports(NotificationType::Email));
    }
}
