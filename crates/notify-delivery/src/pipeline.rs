//! Pipeline assembly.
//!
//! [`Pipeline`] builds every use case over one store, one bus and one
//! channel registry, and runs the three consumer loops, the outbox poller
//! and the retention sweeper in a [`WorkerPool`].
//!
//! ```text
//!  intake ──▶ notifications + outbox ──▶ OutboxPoller ──▶ send / retry / dlq
//!                     ▲                                        │
//!                     └──── ProcessNotification ◀── ConsumerLoop
//! ```

use std::{sync::Arc, time::Duration};

use notify_core::Clock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    bus::{MessageConsumer, MessagePublisher, NotificationPublisher},
    channel::ChannelRegistry,
    consumer::{
        ConsumerConfig, ConsumerLoop, DlqObserver, RecordHandler, RetryHandler, SendHandler,
    },
    error::Result,
    idempotency::IdempotencyLock,
    intake::SendNotification,
    outbox::{OutboxPoller, PublishOutbox},
    process::{ProcessNotification, RetryNotification},
    rate_limit::RateLimiter,
    reprocess::{QueryNotificationStatus, ReprocessDeadLetters},
    retention::{PruneRetention, RetentionSweeper},
    retry::BackoffPolicy,
    stats::{self, PipelineStats, SharedStats},
    storage::NotificationStore,
    worker_pool::WorkerPool,
};

/// Runtime settings of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Consumer loop tuning, shared by the three loops.
    pub consumer: ConsumerConfig,

    /// How often the outbox is polled.
    pub outbox_poll_interval: Duration,

    /// Maximum outbox events published per poll.
    pub outbox_batch_limit: usize,

    /// Delay before a failed outbox publish is attempted again.
    pub publish_retry_delay: Duration,

    /// Admission permits per key per second.
    pub rate_limit_per_second: u32,

    /// Age after which published outbox events and consumed bus records
    /// are deleted.
    pub retention_period: Duration,

    /// How often the retention sweep runs.
    pub retention_sweep_interval: Duration,

    /// Maximum time to wait for the loops on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            consumer: ConsumerConfig::default(),
            outbox_poll_interval: Duration::from_millis(500),
            outbox_batch_limit: 100,
            publish_retry_delay: crate::outbox::DEFAULT_PUBLISH_RETRY_DELAY,
            rate_limit_per_second: crate::rate_limit::DEFAULT_PERMITS_PER_SECOND,
            retention_period: crate::retention::DEFAULT_RETENTION_PERIOD,
            retention_sweep_interval: crate::retention::DEFAULT_SWEEP_INTERVAL,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Consumers for the three topics, each bound to its consumer group.
pub struct TopicConsumers {
    /// Reads the send topic.
    pub send: Arc<dyn MessageConsumer>,
    /// Reads the retry topic.
    pub retry: Arc<dyn MessageConsumer>,
    /// Reads the dlq topic.
    pub dlq: Arc<dyn MessageConsumer>,
}

/// The assembled notification pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn NotificationStore>,
    bus: Arc<dyn MessagePublisher>,
    clock: Arc<dyn Clock>,
    stats: SharedStats,
    send: SendNotification,
    process: ProcessNotification,
    retry: RetryNotification,
    reprocess: ReprocessDeadLetters,
    query: QueryNotificationStatus,
    publish_outbox: PublishOutbox,
    worker_pool: Option<WorkerPool>,
}

impl Pipeline {
    /// Wires the use cases.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NoChannel` if some notification type has no
    /// channel in `registry`.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn NotificationStore>,
        bus: Arc<dyn MessagePublisher>,
        registry: ChannelRegistry,
        backoff: BackoffPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        registry.ensure_coverage()?;

        let stats = stats::shared();
        let publisher = NotificationPublisher::new(bus.clone(), clock.clone());

        let send = SendNotification::new(
            store.clone(),
            Arc::new(RateLimiter::new(config.rate_limit_per_second, clock.clone())),
            Arc::new(IdempotencyLock::new()),
            clock.clone(),
        );
        let process = ProcessNotification::new(
            store.clone(),
            registry,
            backoff,
            clock.clone(),
            stats.clone(),
        );
        let retry = RetryNotification::new(process.clone(), clock.clone());
        let reprocess = ReprocessDeadLetters::new(store.clone(), publisher.clone());
        let query = QueryNotificationStatus::new(store.clone());
        let publish_outbox = PublishOutbox::new(
            store.clone(),
            publisher,
            clock.clone(),
            config.publish_retry_delay,
            stats.clone(),
        );

        Ok(Self {
            config,
            store,
            bus,
            clock,
            stats,
            send,
            process,
            retry,
            reprocess,
            query,
            publish_outbox,
            worker_pool: None,
        })
    }

    /// Starts the consumer loops, the outbox poller and the retention
    /// sweeper.
    ///
    /// Returns immediately after spawning. Use `shutdown()` to stop.
    pub async fn start(&mut self, consumers: TopicConsumers) {
        info!(
            batch_size = self.config.consumer.batch_size,
            outbox_batch_limit = self.config.outbox_batch_limit,
            "starting notification pipeline"
        );

        let mut pool = WorkerPool::new(self.stats.clone());
        let token = pool.cancellation_token();

        let prune = PruneRetention::new(
            self.store.clone(),
            vec![consumers.send.clone(), consumers.retry.clone(), consumers.dlq.clone()],
            self.clock.clone(),
            self.config.retention_period,
            self.stats.clone(),
        );

        let handlers: [(Arc<dyn MessageConsumer>, Arc<dyn RecordHandler>); 3] = [
            (consumers.send, Arc::new(SendHandler::new(self.process.clone()))),
            (consumers.retry, Arc::new(RetryHandler::new(self.retry.clone()))),
            (consumers.dlq, Arc::new(DlqObserver)),
        ];
        for (consumer, handler) in handlers {
            let consumer_loop = ConsumerLoop::new(
                consumer,
                handler,
                self.bus.clone(),
                self.config.consumer.clone(),
                self.clock.clone(),
                self.stats.clone(),
                token.clone(),
            );
            pool.spawn_consumer(consumer_loop).await;
        }

        let poller = OutboxPoller::new(
            self.publish_outbox.clone(),
            self.config.outbox_poll_interval,
            self.config.outbox_batch_limit,
            self.clock.clone(),
            token.clone(),
        );
        pool.spawn_outbox_poller(poller).await;

        let sweeper = RetentionSweeper::new(
            prune,
            self.config.retention_sweep_interval,
            self.clock.clone(),
            token,
        );
        pool.spawn_retention_sweeper(sweeper).await;

        self.worker_pool = Some(pool);
        info!("notification pipeline started");
    }

    /// Resolves when a loop exits on its own, returning its name.
    ///
    /// Never resolves if the pipeline was not started.
    pub async fn wait_for_exit(&self) -> &'static str {
        match &self.worker_pool {
            Some(pool) => match pool.wait_for_exit().await {
                Some(name) => name,
                None => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    /// Stops every loop, letting in-flight batches finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` or
    /// `DeliveryError::WorkerPanic` from the worker pool.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down notification pipeline");

        if let Some(pool) = self.worker_pool.take() {
            pool.shutdown_graceful(self.config.shutdown_timeout).await
        } else {
            info!("pipeline was not started, shutdown completed immediately");
            Ok(())
        }
    }

    /// Returns current pipeline statistics.
    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Intake use case.
    pub fn send(&self) -> &SendNotification {
        &self.send
    }

    /// Delivery use case.
    pub fn process(&self) -> &ProcessNotification {
        &self.process
    }

    /// Retry use case.
    pub fn retry(&self) -> &RetryNotification {
        &self.retry
    }

    /// Dead-letter reprocessing.
    pub fn reprocess(&self) -> &ReprocessDeadLetters {
        &self.reprocess
    }

    /// Status queries.
    pub fn query(&self) -> &QueryNotificationStatus {
        &self.query
    }

    /// Outbox publishing, for running a cycle by hand.
    pub fn publish_outbox(&self) -> &PublishOutbox {
        &self.publish_outbox
    }
}
