//! Notification delivery pipeline with at-least-once guarantees.
//!
//! This crate runs everything between an accepted send request and a
//! delivered (or dead-lettered) notification.
//!
//! # Architecture
//!
//! Intake stores each new notification together with an outbox event in one
//! transaction. The outbox poller publishes due events to the message bus.
//! Consumer loops read the send and retry topics and run the delivery state
//! machine, which writes every failure transition together with a new outbox
//! event for the retry or dlq topic.
//!
//! 1. **Intake** - per-key lock, dedup by idempotency key, rate limiting
//! 2. **Outbox** - store-first, publish-second
//! 3. **Delivery** - channel registry, circuit breaker, call timeout
//! 4. **Retry** - exponential backoff with jitter, dead-letter at the ceiling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use notify_core::RealClock;
//! use notify_delivery::{
//!     bus::mock::InMemoryBus,
//!     channels::{EmailChannel, WebhookChannel, WebhookConfig},
//!     storage::mock::MockNotificationStore,
//!     BackoffPolicy, ChannelRegistry, Pipeline, PipelineConfig, TopicConsumers,
//! };
//!
//! # async fn example() -> notify_delivery::Result<()> {
//! let bus = InMemoryBus::new();
//! let registry = ChannelRegistry::new(vec![
//!     Arc::new(EmailChannel::new()),
//!     Arc::new(WebhookChannel::new(WebhookConfig::default())?),
//! ]);
//! let mut pipeline = Pipeline::new(
//!     PipelineConfig::default(),
//!     Arc::new(MockNotificationStore::new()),
//!     Arc::new(bus.clone()),
//!     registry,
//!     BackoffPolicy::default(),
//!     Arc::new(RealClock::new()),
//! )?;
//!
//! pipeline
//!     .start(TopicConsumers {
//!         send: Arc::new(bus.consumer("send", notify_core::topics::SEND)),
//!         retry: Arc::new(bus.consumer("retry", notify_core::topics::RETRY)),
//!         dlq: Arc::new(bus.consumer("dlq", notify_core::topics::DLQ)),
//!     })
//!     .await;
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod channel;
pub mod channels;
pub mod circuit;
pub mod consumer;
pub mod error;
pub mod idempotency;
pub mod intake;
pub mod outbox;
pub mod pipeline;
pub mod process;
pub mod rate_limit;
pub mod reprocess;
pub mod retention;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod worker_pool;

pub use bus::{BusRecord, MessageConsumer, MessagePublisher, NotificationPublisher};
pub use channel::{ChannelRegistry, NotificationChannel};
pub use circuit::{CircuitBreaker, CircuitBreakerChannel, CircuitConfig, CircuitState};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use intake::{CreateNotification, SendNotification};
pub use outbox::{OutboxPoller, PublishOutbox};
pub use pipeline::{Pipeline, PipelineConfig, TopicConsumers};
pub use process::{DeliveryOutcome, ProcessNotification, RetryNotification};
pub use reprocess::{QueryNotificationStatus, ReprocessDeadLetters};
pub use retention::{PruneReport, PruneRetention, RetentionSweeper};
pub use retry::{BackoffPolicy, RetryDecision, RetryPolicy};
pub use stats::PipelineStats;
pub use storage::NotificationStore;
pub use worker_pool::WorkerPool;
