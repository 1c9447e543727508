//! echo-notify notification delivery service.
//!
//! Main entry point. Loads configuration, prepares the database, wires the
//! pipeline over PostgreSQL and coordinates graceful shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use notify_core::{
    storage::{schema, Storage},
    topics, Clock, RealClock,
};
use notify_delivery::{
    bus::PostgresMessageBus,
    channels::{EmailChannel, WebhookChannel},
    storage::PostgresNotificationStore,
    ChannelRegistry, CircuitBreakerChannel, NotificationChannel, Pipeline, TopicConsumers,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;
    info!("Starting echo-notify");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        max_retry_attempts = config.max_retry_attempts,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    schema::ensure_schema(&db_pool).await.context("Failed to prepare database schema")?;
    info!("Database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));
    let store = Arc::new(PostgresNotificationStore::new(storage.clone(), clock.clone()));
    let bus = Arc::new(PostgresMessageBus::new(storage, clock.clone()));

    let registry = build_registry(&config, clock.clone())?;
    let mut pipeline = Pipeline::new(
        config.to_pipeline_config(),
        store,
        bus.clone(),
        registry,
        config.to_backoff_policy(),
        clock,
    )
    .context("Failed to assemble delivery pipeline")?;

    pipeline
        .start(TopicConsumers {
            send: Arc::new(bus.consumer(config.send_consumer_group.as_str(), topics::SEND)),
            retry: Arc::new(bus.consumer(config.retry_consumer_group.as_str(), topics::RETRY)),
            dlq: Arc::new(bus.consumer(config.dlq_consumer_group.as_str(), topics::DLQ)),
        })
        .await;
    info!("echo-notify is delivering notifications");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, starting graceful shutdown");
        }
        worker = pipeline.wait_for_exit() => {
            error!(worker, "Pipeline worker exited unexpectedly, shutting down");
        }
    }

    let final_stats = pipeline.stats().await;
    if let Err(e) = pipeline.shutdown().await {
        warn!(error = %e, "Pipeline did not shut down cleanly");
    }
    info!(
        sent = final_stats.sent,
        retries_scheduled = final_stats.retries_scheduled,
        dead_lettered = final_stats.dead_lettered,
        "Pipeline stopped"
    );

    db_pool.close().await;
    info!("Database connections closed");

    info!("echo-notify shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured directive.
fn init_tracing(default_directive: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .context("Invalid log filter directive")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Registers the built-in channels, each behind its own circuit breaker.
fn build_registry(config: &Config, clock: Arc<dyn Clock>) -> Result<ChannelRegistry> {
    let circuit = config.to_circuit_config();
    let webhook =
        WebhookChannel::new(config.to_webhook_config()).context("Failed to build webhook channel")?;

    let channels: Vec<Arc<dyn NotificationChannel>> = vec![
        Arc::new(CircuitBreakerChannel::new(
            Arc::new(EmailChannel::new()),
            circuit.clone(),
            clock.clone(),
        )),
        Arc::new(CircuitBreakerChannel::new(Arc::new(webhook), circuit, clock)),
    ];

    Ok(ChannelRegistry::new(channels))
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
