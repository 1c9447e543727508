//! Circuit breaker for delivery channels.
//!
//! Each channel instance gets its own breaker. Consecutive failures are
//! counted while closed; reaching the threshold opens the circuit for a fixed
//! window, during which calls fail immediately without touching the channel.
//!
//! ```text
//!   ┌──────────────────────┐   threshold reached   ┌──────────────────────┐
//!   │        CLOSED        │ ────────────────────▶ │         OPEN         │
//!   │ calls pass through   │                       │ calls fail fast      │
//!   │ success resets count │ ◀──────────────────── │ until open_until     │
//!   └──────────────────────┘    window elapsed     └──────────────────────┘
//! ```
//!
//! There is no probe gating after the window: the next call is evaluated like
//! any call on a closed circuit.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify_core::{Clock, Notification, NotificationType};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    channel::NotificationChannel,
    error::{DeliveryError, Result},
};

/// Circuit breaker and call budget configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Number of consecutive failures that opens the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open.
    pub open_window: Duration,
    /// Time budget for a single channel call.
    pub call_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_window: Duration::from_secs(30),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail immediately.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<DateTime<Utc>>,
}

/// Failure counter with an open window.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, state: Mutex::new(BreakerState::default()), clock }
    }

    /// Returns true if a call may proceed now.
    pub async fn should_allow_request(&self) -> bool {
        let now = self.clock.now_utc();
        let state = self.state.lock().await;
        state.open_until.is_none_or(|until| now >= until)
    }

    /// Records a successful call and resets the failure count.
    pub async fn record_success(&self) {
        self.state.lock().await.consecutive_failures = 0;
    }

    /// Records a failed call. Returns true if this failure opened the
    /// circuit.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_failure(&self) -> bool {
        let mut state = self.state.lock().await;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.consecutive_failures < self.config.failure_threshold {
            return false;
        }

        let now = self.clock.now_utc();
        state.open_until = Some(
            chrono::Duration::from_std(self.config.open_window)
                .ok()
                .and_then(|window| now.checked_add_signed(window))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
        state.consecutive_failures = 0;
        true
    }

    /// Current state as seen at the clock's present time.
    pub async fn state(&self) -> CircuitState {
        if self.should_allow_request().await {
            CircuitState::Closed
        } else {
            CircuitState::Open
        }
    }

    /// Consecutive failures counted toward the threshold.
    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }
}

/// A channel guarded by a circuit breaker and a per-call timeout.
///
/// Timeouts count as failures. While the circuit is open the wrapped channel
/// is not called and `DeliveryError::CircuitOpen` is returned, which the
/// delivery use case treats like any other failed attempt.
pub struct CircuitBreakerChannel {
    inner: Arc<dyn NotificationChannel>,
    breaker: CircuitBreaker,
}

impl CircuitBreakerChannel {
    /// Wraps a channel with a fresh breaker.
    pub fn new(
        inner: Arc<dyn NotificationChannel>,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { inner, breaker: CircuitBreaker::new(config, clock) }
    }

    /// The breaker guarding this channel.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl NotificationChannel for CircuitBreakerChannel {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports(&self, notification_type: NotificationType) -> bool {
        self.inner.supports(notification_type)
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        if !self.breaker.should_allow_request().await {
            debug!(
                channel = self.inner.name(),
                notification_id = %notification.id,
                "circuit open, skipping channel call"
            );
            return Err(DeliveryError::circuit_open(self.inner.name()));
        }

        let call_timeout = self.breaker.config.call_timeout;
        let result = match tokio::time::timeout(call_timeout, self.inner.send(notification)).await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(DeliveryError::timeout(call_timeout)),
        };

        match &result {
            Ok(()) => self.breaker.record_success().await,
            Err(error) => {
                if self.breaker.record_failure().await {
                    warn!(
                        channel = self.inner.name(),
                        open_window_secs = self.breaker.config.open_window.as_secs(),
                        error = %error,
                        "circuit breaker opened"
                    );
                }
            },
        }

        result
    }
}
