//! Exponential backoff with additive jitter.
//!
//! The delay before redelivery attempt `n` is
//! `min(base_delay * 2^n + jitter, max_delay)` where `jitter` is drawn
//! uniformly from `[0, 250ms)`. Policies are configurable per notification
//! type with a default fallback. The jitter source is injectable so schedules
//! are reproducible in tests.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use notify_core::NotificationType;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Upper bound (exclusive) of the jitter added to every delay.
pub const MAX_JITTER: Duration = Duration::from_millis(250);

/// Retry limits for one notification type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed attempts after which the notification is dead-lettered.
    pub max_attempts: u32,

    /// Base delay for exponential backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts, jitter included.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(300_000),
        }
    }
}

impl RetryPolicy {
    /// Delay without jitter for the given retry count, capped at `max_delay`.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(retry_count.min(31));
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

/// Source of the random component added to backoff delays.
pub trait JitterSource: Send + Sync + fmt::Debug {
    /// Returns a duration in `[0, bound)`. A zero bound yields zero.
    fn jitter(&self, bound: Duration) -> Duration;
}

/// Thread-local random jitter for production use.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, bound: Duration) -> Duration {
        let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
        if bound_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..bound_ms))
    }
}

/// Constant jitter, clamped below the bound.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedJitter(pub Duration);

impl JitterSource for FixedJitter {
    fn jitter(&self, bound: Duration) -> Duration {
        if bound.is_zero() {
            return Duration::ZERO;
        }
        self.0.min(bound.saturating_sub(Duration::from_millis(1)))
    }
}

/// Reproducible jitter from a seeded generator.
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    /// Creates a jitter source with a fixed seed.
    pub fn new(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }
}

impl JitterSource for SeededJitter {
    fn jitter(&self, bound: Duration) -> Duration {
        let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
        if bound_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Duration::from_millis(rng.random_range(0..bound_ms))
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver at the specified time.
    Retry {
        /// When the next delivery attempt should be made
        next_retry_at: DateTime<Utc>,
    },
    /// Attempt ceiling reached; dead-letter the notification.
    GiveUp {
        /// Reason why the delivery should not be retried
        reason: String,
    },
}

/// Backoff schedule with per-type overrides.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    default_policy: RetryPolicy,
    overrides: HashMap<NotificationType, RetryPolicy>,
    jitter: Arc<dyn JitterSource>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl BackoffPolicy {
    /// Creates a backoff policy applying `default_policy` to every type.
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self { default_policy, overrides: HashMap::new(), jitter: Arc::new(RandomJitter) }
    }

    /// Overrides the policy for one notification type.
    #[must_use]
    pub fn with_override(
        mut self,
        notification_type: NotificationType,
        policy: RetryPolicy,
    ) -> Self {
        self.overrides.insert(notification_type, policy);
        self
    }

    /// Replaces the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Policy applied to the given type.
    pub fn policy_for(&self, notification_type: NotificationType) -> &RetryPolicy {
        self.overrides.get(&notification_type).unwrap_or(&self.default_policy)
    }

    /// Attempt ceiling for the given type.
    pub fn max_attempts(&self, notification_type: NotificationType) -> u32 {
        self.policy_for(notification_type).max_attempts
    }

    /// Delay before the attempt following `retry_count` failures.
    pub fn delay(&self, notification_type: NotificationType, retry_count: u32) -> Duration {
        let policy = self.policy_for(notification_type);
        let jitter = self.jitter.jitter(MAX_JITTER);
        policy.base_delay_for(retry_count).saturating_add(jitter).min(policy.max_delay)
    }

    /// Decides what to do after a failed attempt that brought the retry
    /// count to `next_count`.
    pub fn decide(
        &self,
        notification_type: NotificationType,
        next_count: u32,
        failed_at: DateTime<Utc>,
    ) -> RetryDecision {
        let max_attempts = self.max_attempts(notification_type);
        if next_count >= max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({max_attempts}) reached"),
            };
        }

        let delay = self.delay(notification_type, next_count);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_retry_at: failed_at + chrono_delay }
    }
}
