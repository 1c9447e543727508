//! Configuration management for the echo-notify service.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use notify_core::NotificationType;
use notify_delivery::{
    channels::WebhookConfig, circuit::CircuitConfig, consumer::ConsumerConfig, BackoffPolicy,
    PipelineConfig, RetryPolicy,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,
    /// Maximum lifetime of a connection in seconds.
    ///
    /// Environment variable: `DATABASE_MAX_LIFETIME`
    #[serde(default = "default_max_lifetime", alias = "DATABASE_MAX_LIFETIME")]
    pub database_max_lifetime: u64,

    // Outbox
    /// Outbox poll interval in milliseconds.
    ///
    /// Environment variable: `OUTBOX_POLL_INTERVAL_MS`
    #[serde(default = "default_outbox_poll_interval_ms", alias = "OUTBOX_POLL_INTERVAL_MS")]
    pub outbox_poll_interval_ms: u64,
    /// Maximum outbox events published per poll.
    ///
    /// Environment variable: `OUTBOX_BATCH_LIMIT`
    #[serde(default = "default_outbox_batch_limit", alias = "OUTBOX_BATCH_LIMIT")]
    pub outbox_batch_limit: usize,
    /// Delay before a failed outbox publish is retried, in milliseconds.
    ///
    /// Environment variable: `OUTBOX_PUBLISH_RETRY_DELAY_MS`
    #[serde(
        default = "default_publish_retry_delay_ms",
        alias = "OUTBOX_PUBLISH_RETRY_DELAY_MS"
    )]
    pub outbox_publish_retry_delay_ms: u64,

    // Consumers
    /// Maximum records per consumer poll.
    ///
    /// Environment variable: `CONSUMER_BATCH_SIZE`
    #[serde(default = "default_consumer_batch_size", alias = "CONSUMER_BATCH_SIZE")]
    pub consumer_batch_size: usize,
    /// Idle wait between empty consumer polls in milliseconds.
    ///
    /// Environment variable: `CONSUMER_POLL_INTERVAL_MS`
    #[serde(default = "default_consumer_poll_interval_ms", alias = "CONSUMER_POLL_INTERVAL_MS")]
    pub consumer_poll_interval_ms: u64,
    /// Consumer group reading the send topic.
    ///
    /// Environment variable: `SEND_CONSUMER_GROUP`
    #[serde(default = "default_send_group", alias = "SEND_CONSUMER_GROUP")]
    pub send_consumer_group: String,
    /// Consumer group reading the retry topic.
    ///
    /// Environment variable: `RETRY_CONSUMER_GROUP`
    #[serde(default = "default_retry_group", alias = "RETRY_CONSUMER_GROUP")]
    pub retry_consumer_group: String,
    /// Consumer group reading the dlq topic.
    ///
    /// Environment variable: `DLQ_CONSUMER_GROUP`
    #[serde(default = "default_dlq_group", alias = "DLQ_CONSUMER_GROUP")]
    pub dlq_consumer_group: String,

    // Retry
    /// Failed attempts before a notification is dead-lettered.
    ///
    /// Environment variable: `MAX_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "MAX_RETRY_ATTEMPTS")]
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Attempt ceiling for EMAIL, falling back to `max_retry_attempts`.
    ///
    /// Environment variable: `EMAIL_MAX_RETRY_ATTEMPTS`
    #[serde(default, alias = "EMAIL_MAX_RETRY_ATTEMPTS")]
    pub email_max_retry_attempts: Option<u32>,
    /// Attempt ceiling for WEBHOOK, falling back to `max_retry_attempts`.
    ///
    /// Environment variable: `WEBHOOK_MAX_RETRY_ATTEMPTS`
    #[serde(default, alias = "WEBHOOK_MAX_RETRY_ATTEMPTS")]
    pub webhook_max_retry_attempts: Option<u32>,
    /// Backoff base delay for EMAIL, falling back to `retry_base_delay_ms`.
    ///
    /// Environment variable: `EMAIL_RETRY_BASE_DELAY_MS`
    #[serde(default, alias = "EMAIL_RETRY_BASE_DELAY_MS")]
    pub email_retry_base_delay_ms: Option<u64>,
    /// Delay ceiling for EMAIL, falling back to `retry_max_delay_ms`.
    ///
    /// Environment variable: `EMAIL_RETRY_MAX_DELAY_MS`
    #[serde(default, alias = "EMAIL_RETRY_MAX_DELAY_MS")]
    pub email_retry_max_delay_ms: Option<u64>,
    /// Backoff base delay for WEBHOOK, falling back to `retry_base_delay_ms`.
    ///
    /// Environment variable: `WEBHOOK_RETRY_BASE_DELAY_MS`
    #[serde(default, alias = "WEBHOOK_RETRY_BASE_DELAY_MS")]
    pub webhook_retry_base_delay_ms: Option<u64>,
    /// Delay ceiling for WEBHOOK, falling back to `retry_max_delay_ms`.
    ///
    /// Environment variable: `WEBHOOK_RETRY_MAX_DELAY_MS`
    #[serde(default, alias = "WEBHOOK_RETRY_MAX_DELAY_MS")]
    pub webhook_retry_max_delay_ms: Option<u64>,

    // Circuit breaker
    /// Consecutive failures that open a channel's circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds the circuit stays open.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_OPEN_SECONDS`
    #[serde(default = "default_circuit_open_seconds", alias = "CIRCUIT_BREAKER_OPEN_SECONDS")]
    pub circuit_breaker_open_seconds: u64,
    /// Time budget of one channel call in seconds.
    ///
    /// Environment variable: `CHANNEL_CALL_TIMEOUT_SECONDS`
    #[serde(default = "default_call_timeout", alias = "CHANNEL_CALL_TIMEOUT_SECONDS")]
    pub channel_call_timeout_seconds: u64,

    // Admission
    /// Notifications admitted per key per second.
    ///
    /// Environment variable: `RATE_LIMIT_PER_SECOND`
    #[serde(default = "default_rate_limit", alias = "RATE_LIMIT_PER_SECOND")]
    pub rate_limit_per_second: u32,

    // Webhook client
    /// HTTP timeout for webhook delivery in seconds.
    ///
    /// Environment variable: `WEBHOOK_TIMEOUT_SECONDS`
    #[serde(default = "default_webhook_timeout", alias = "WEBHOOK_TIMEOUT_SECONDS")]
    pub webhook_timeout_seconds: u64,
    /// User agent sent with webhook requests.
    ///
    /// Environment variable: `WEBHOOK_USER_AGENT`
    #[serde(default = "default_user_agent", alias = "WEBHOOK_USER_AGENT")]
    pub webhook_user_agent: String,

    // Retention
    /// Age in seconds after which published outbox events and consumed bus
    /// records are deleted.
    ///
    /// Environment variable: `RETENTION_PERIOD_SECONDS`
    #[serde(default = "default_retention_period", alias = "RETENTION_PERIOD_SECONDS")]
    pub retention_period_seconds: u64,
    /// Seconds between retention sweeps.
    ///
    /// Environment variable: `RETENTION_SWEEP_INTERVAL_SECONDS`
    #[serde(default = "default_sweep_interval", alias = "RETENTION_SWEEP_INTERVAL_SECONDS")]
    pub retention_sweep_interval_seconds: u64,

    /// Grace period for in-flight work on shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter directive used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Default retry policy plus an override for every type with at least
    /// one per-type setting.
    pub fn to_backoff_policy(&self) -> BackoffPolicy {
        let mut backoff = BackoffPolicy::new(self.retry_policy(RetryOverrides::default()));

        for notification_type in NotificationType::ALL {
            let overrides = self.retry_overrides(notification_type);
            if overrides.is_set() {
                backoff = backoff.with_override(notification_type, self.retry_policy(overrides));
            }
        }

        backoff
    }

    fn retry_overrides(&self, notification_type: NotificationType) -> RetryOverrides {
        match notification_type {
            NotificationType::Email => RetryOverrides {
                max_attempts: self.email_max_retry_attempts,
                base_delay_ms: self.email_retry_base_delay_ms,
                max_delay_ms: self.email_retry_max_delay_ms,
            },
            NotificationType::Webhook => RetryOverrides {
                max_attempts: self.webhook_max_retry_attempts,
                base_delay_ms: self.webhook_retry_base_delay_ms,
                max_delay_ms: self.webhook_retry_max_delay_ms,
            },
        }
    }

    fn retry_policy(&self, overrides: RetryOverrides) -> RetryPolicy {
        RetryPolicy {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_retry_attempts),
            base_delay: Duration::from_millis(
                overrides.base_delay_ms.unwrap_or(self.retry_base_delay_ms),
            ),
            max_delay: Duration::from_millis(
                overrides.max_delay_ms.unwrap_or(self.retry_max_delay_ms),
            ),
        }
    }

    /// Breaker settings applied to every channel.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            open_window: Duration::from_secs(self.circuit_breaker_open_seconds),
            call_timeout: Duration::from_secs(self.channel_call_timeout_seconds),
        }
    }

    /// Loop and admission settings.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            consumer: ConsumerConfig {
                batch_size: self.consumer_batch_size,
                poll_interval: Duration::from_millis(self.consumer_poll_interval_ms),
            },
            outbox_poll_interval: Duration::from_millis(self.outbox_poll_interval_ms),
            outbox_batch_limit: self.outbox_batch_limit,
            publish_retry_delay: Duration::from_millis(self.outbox_publish_retry_delay_ms),
            rate_limit_per_second: self.rate_limit_per_second,
            retention_period: Duration::from_secs(self.retention_period_seconds),
            retention_sweep_interval: Duration::from_secs(self.retention_sweep_interval_seconds),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
        }
    }

    /// HTTP client settings of the webhook channel.
    pub fn to_webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            timeout: Duration::from_secs(self.webhook_timeout_seconds),
            user_agent: self.webhook_user_agent.clone(),
        }
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.outbox_batch_limit == 0 || self.consumer_batch_size == 0 {
            anyhow::bail!("batch sizes must be greater than 0");
        }

        if self.outbox_poll_interval_ms == 0 || self.consumer_poll_interval_ms == 0 {
            anyhow::bail!("poll intervals must be greater than 0");
        }

        let attempt_ceilings = [
            Some(self.max_retry_attempts),
            self.email_max_retry_attempts,
            self.webhook_max_retry_attempts,
        ];
        if attempt_ceilings.into_iter().flatten().any(|attempts| attempts == 0) {
            anyhow::bail!("retry attempt ceilings must be greater than 0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        for notification_type in NotificationType::ALL {
            let policy = self.retry_policy(self.retry_overrides(notification_type));
            if policy.base_delay > policy.max_delay {
                anyhow::bail!(
                    "{notification_type} retry base delay cannot exceed its max delay"
                );
            }
        }

        if self.circuit_breaker_failure_threshold == 0 {
            anyhow::bail!("circuit_breaker_failure_threshold must be greater than 0");
        }

        if self.rate_limit_per_second == 0 {
            anyhow::bail!("rate_limit_per_second must be greater than 0");
        }

        if self.retention_period_seconds == 0 || self.retention_sweep_interval_seconds == 0 {
            anyhow::bail!("retention period and sweep interval must be greater than 0");
        }

        let groups =
            [&self.send_consumer_group, &self.retry_consumer_group, &self.dlq_consumer_group];
        if groups.iter().any(|group| group.trim().is_empty()) {
            anyhow::bail!("consumer group names must not be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            database_max_lifetime: default_max_lifetime(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
            outbox_batch_limit: default_outbox_batch_limit(),
            outbox_publish_retry_delay_ms: default_publish_retry_delay_ms(),
            consumer_batch_size: default_consumer_batch_size(),
            consumer_poll_interval_ms: default_consumer_poll_interval_ms(),
            send_consumer_group: default_send_group(),
            retry_consumer_group: default_retry_group(),
            dlq_consumer_group: default_dlq_group(),
            max_retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            email_max_retry_attempts: None,
            webhook_max_retry_attempts: None,
            email_retry_base_delay_ms: None,
            email_retry_max_delay_ms: None,
            webhook_retry_base_delay_ms: None,
            webhook_retry_max_delay_ms: None,
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_open_seconds: default_circuit_open_seconds(),
            channel_call_timeout_seconds: default_call_timeout(),
            rate_limit_per_second: default_rate_limit(),
            webhook_timeout_seconds: default_webhook_timeout(),
            webhook_user_agent: default_user_agent(),
            retention_period_seconds: default_retention_period(),
            retention_sweep_interval_seconds: default_sweep_interval(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

/// Per-type retry settings; unset fields fall back to the global ones.
#[derive(Debug, Clone, Copy, Default)]
struct RetryOverrides {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

impl RetryOverrides {
    fn is_set(&self) -> bool {
        self.max_attempts.is_some() || self.base_delay_ms.is_some() || self.max_delay_ms.is_some()
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/echo_notify".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_outbox_poll_interval_ms() -> u64 {
    500
}

fn default_outbox_batch_limit() -> usize {
    100
}

fn default_publish_retry_delay_ms() -> u64 {
    5000
}

fn default_consumer_batch_size() -> usize {
    100
}

fn default_consumer_poll_interval_ms() -> u64 {
    500
}

fn default_send_group() -> String {
    "notification-send".to_string()
}

fn default_retry_group() -> String {
    "notification-retry".to_string()
}

fn default_dlq_group() -> String {
    "notification-dlq".to_string()
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_circuit_open_seconds() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    10
}

fn default_rate_limit() -> u32 {
    100
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    "echo-notify/0.1".to_string()
}

fn default_retention_period() -> u64 {
    86_400
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
