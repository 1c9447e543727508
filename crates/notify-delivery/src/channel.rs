//! Delivery channel abstraction and registry.
//!
//! A channel knows how to deliver notifications of the types it supports.
//! The registry holds channels in registration order and resolves the first
//! one that supports a notification's type.

use std::sync::Arc;

use async_trait::async_trait;
use notify_core::{Notification, NotificationType};

use crate::error::{DeliveryError, Result};

/// A capability-typed sender.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Stable channel name used in logs and breaker errors.
    fn name(&self) -> &str;

    /// Returns true if this channel can deliver the given type.
    fn supports(&self, notification_type: NotificationType) -> bool;

    /// Performs one delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns a delivery failure (`DeliveryError::is_delivery_failure`)
    /// when the attempt did not succeed.
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Ordered collection of channels.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.channels.iter().map(|c| c.name())).finish()
    }
}

impl ChannelRegistry {
    /// Creates a registry from channels in priority order.
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    /// Returns the first channel supporting `notification_type`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NoChannel` if none does. This is a
    /// configuration error, not a per-notification failure.
    pub fn find(
        &self,
        notification_type: NotificationType,
    ) -> Result<Arc<dyn NotificationChannel>> {
        self.channels
            .iter()
            .find(|channel| channel.supports(notification_type))
            .cloned()
            .ok_or_else(|| DeliveryError::no_channel(notification_type))
    }

    /// Verifies every notification type has a channel.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NoChannel` for the first uncovered type.
    pub fn ensure_coverage(&self) -> Result<()> {
        for notification_type in NotificationType::ALL {
            self.find(notification_type)?;
        }
        Ok(())
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Returns true if no channel is registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
