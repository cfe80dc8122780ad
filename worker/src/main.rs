//! RouteMinds order processing worker.
//!
//! Consumes `OrderCreated` events from Redpanda, assigns each order to its
//! nearest hub, commits the route plan to Postgres and caches it. Stops on
//! Ctrl-C, giving in-flight orders `SHUTDOWN_TIMEOUT_SECS` to finish.

mod cache;
mod config;

use anyhow::Context;
use cache::RouteCache;
use config::WorkerConfig;
use routeminds_core::dead_letter::DeadLetterSink;
use routeminds_core::environment::{Clock, SystemClock};
use routeminds_core::event_bus::EventBus;
use routeminds_postgres::{PostgresDeadLetterQueue, PostgresOrderStore};
use routeminds_redpanda::RedpandaEventBus;
use routeminds_runtime::metrics::MetricsServer;
use routeminds_runtime::{Consumer, HealthReport, OrderProcessor};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may be set directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "routeminds=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting RouteMinds order worker");

    let config = WorkerConfig::from_env().context("Invalid configuration")?;
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        consumer_group = %config.redpanda.consumer_group,
        topic = %config.redpanda.order_topic,
        concurrency = config.consumer.concurrency,
        prefetch = config.consumer.prefetch,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start().context("Failed to start metrics server")?;

    info!("Connecting to order database...");
    let store = PostgresOrderStore::connect(&config.postgres.url, config.postgres.max_connections)
        .await
        .context("Failed to connect to Postgres")?;
    store.migrate().await.context("Failed to run migrations")?;
    let dead_letters: Arc<dyn DeadLetterSink> =
        Arc::new(PostgresDeadLetterQueue::new(store.pool().clone()));
    info!("Order database ready");

    let cache = RouteCache::connect(config.redis_url.as_deref())
        .await
        .context("Failed to connect to Redis")?;
    info!(backend = cache.backend(), "Route cache ready");

    let event_bus: Arc<dyn EventBus> = Arc::new(
        RedpandaEventBus::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .buffer_size(config.consumer.prefetch)
            .build()
            .context("Failed to create Redpanda event bus")?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let processor = OrderProcessor::new(store, cache, Arc::clone(&clock))
        .with_config(config.processor_config());

    let consumer = Consumer::new(processor, event_bus, dead_letters, Arc::clone(&clock))
        .with_config(config.consumer_config())
        .start()
        .await
        .context("Failed to start consumer")?;
    info!("Worker running, press Ctrl-C to stop");

    let mut health_interval = tokio::time::interval(HEALTH_LOG_INTERVAL);
    health_interval.tick().await;
    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
            _ = health_interval.tick() => {
                let report = HealthReport::new(vec![consumer.health()], clock.now());
                if report.status.is_healthy() {
                    info!(status = %report.status, stats = ?consumer.stats(), "Health check");
                } else {
                    warn!(status = %report.status, checks = ?report.checks, "Health check");
                }
            }
        }
    }

    info!(
        timeout_secs = config.shutdown_timeout.as_secs(),
        "Shutdown requested, draining in-flight orders"
    );
    let stats = consumer
        .shutdown(config.shutdown_timeout)
        .await
        .context("Consumer did not shut down cleanly")?;
    info!(
        processed = stats.processed,
        skipped = stats.skipped,
        dead_lettered = stats.dead_lettered,
        discarded = stats.discarded,
        "Worker stopped"
    );

    Ok(())
}
