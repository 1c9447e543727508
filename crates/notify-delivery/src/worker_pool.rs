//! Supervision of the pipeline loops.
//!
//! The consumer loops, the outbox poller and the retention sweeper each run
//! as their own task.
//! They share one cancellation token; shutdown cancels it, lets every loop
//! finish its in-flight batch and joins them within a time budget.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    consumer::ConsumerLoop,
    error::{DeliveryError, Result},
    outbox::OutboxPoller,
    retention::RetentionSweeper,
    stats::{PipelineStats, SharedStats},
};

/// How often `wait_for_exit` checks the tasks.
const SUPERVISION_INTERVAL: Duration = Duration::from_millis(250);

struct Worker {
    name: &'static str,
    handle: JoinHandle<Result<()>>,
}

/// Supervised set of pipeline loops.
pub struct WorkerPool {
    workers: Vec<Worker>,
    stats: SharedStats,
    cancellation_token: CancellationToken,
}

impl WorkerPool {
    /// Creates an empty pool. Loops spawned into it must be built with
    /// [`WorkerPool::cancellation_token`].
    pub fn new(stats: SharedStats) -> Self {
        Self { workers: Vec::new(), stats, cancellation_token: CancellationToken::new() }
    }

    /// Token observed by every loop of this pool.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawns a consumer loop.
    pub async fn spawn_consumer(&mut self, consumer: ConsumerLoop) {
        let name = consumer.name();
        self.spawn_worker(name, async move { consumer.run().await }).await;
    }

    /// Spawns the outbox poller.
    pub async fn spawn_outbox_poller(&mut self, poller: OutboxPoller) {
        self.spawn_worker("outbox", async move { poller.run().await }).await;
    }

    /// Spawns the retention sweeper.
    pub async fn spawn_retention_sweeper(&mut self, sweeper: RetentionSweeper) {
        self.spawn_worker("retention", async move { sweeper.run().await }).await;
    }

    async fn spawn_worker<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let worker_id = self.workers.len();
        let handle = tokio::spawn(async move {
            info!(worker_id, worker = name, "pipeline worker starting");

            let result = task.await;

            if let Err(ref error) = result {
                error!(
                    worker_id,
                    worker = name,
                    error = %error,
                    "pipeline worker terminated with error"
                );
            } else {
                info!(worker_id, worker = name, "pipeline worker stopped gracefully");
            }

            result
        });

        self.workers.push(Worker { name, handle });
        self.stats.write().await.active_workers = self.workers.len();
    }

    /// Resolves once any worker has exited and returns its name.
    ///
    /// Workers only exit on their own after a fatal error, so this is the
    /// signal to shut the whole pipeline down.
    pub async fn wait_for_exit(&self) -> Option<&'static str> {
        if self.workers.is_empty() {
            return None;
        }
        loop {
            if let Some(worker) = self.workers.iter().find(|w| w.handle.is_finished()) {
                return Some(worker.name);
            }
            tokio::time::sleep(SUPERVISION_INTERVAL).await;
        }
    }

    /// Snapshot of the pipeline counters.
    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Cancels every worker and waits for them to finish their current
    /// batch.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if the workers do not finish
    /// within `timeout`, or `DeliveryError::WorkerPanic` for the first worker
    /// that panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.workers.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let workers = std::mem::take(&mut self.workers);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut panic = None;

            for (worker_id, worker) in workers.into_iter().enumerate() {
                match worker.handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id,
                            worker = worker.name,
                            error = %error,
                            "worker completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            worker = worker.name,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;
            panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.workers.iter().filter(|w| !w.handle.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "worker pool dropped with active workers, forcing cancellation"
            );

            self.cancellation_token.cancel();

            warn!("worker pool was not shut down gracefully, call shutdown_graceful() first");
        }
    }
}
