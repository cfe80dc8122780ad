//! Prometheus metrics for the order pipeline.
//!
//! Metric names:
//! - `orders_created_total`: orders accepted by the intake path
//! - `orders_processed_total`: route plans computed and committed
//! - `orders_skipped_total`: deliveries for orders that were already processed
//! - `order_attempts_failed_total`: failed processing attempts, retried or not
//! - `orders_dead_lettered_total`: messages moved to the dead-letter queue
//! - `orders_discarded_total`: messages acknowledged without processing
//! - `order_processing_duration_seconds`: wall time from delivery to settlement
//! - `consumer_in_flight`: deliveries currently being handled
//!
//! # Example
//!
//! ```rust,no_run
//! use routeminds_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves the scrape endpoint on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server bound to `addr` once started.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP exporter.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// If a recorder is already installed (another server in the same process,
    /// as happens in tests) this logs a warning and leaves the existing one in
    /// place; [`handle`](Self::handle) then stays `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be built or bound.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!("orders_created_total", "Orders accepted by the intake path");
    describe_counter!(
        "orders_processed_total",
        "Orders whose route plan was computed and committed"
    );
    describe_counter!(
        "orders_skipped_total",
        "Deliveries for orders that already had a route plan"
    );
    describe_counter!(
        "order_attempts_failed_total",
        "Failed processing attempts, labelled by disposition"
    );
    describe_counter!(
        "orders_dead_lettered_total",
        "Messages moved to the dead-letter queue"
    );
    describe_counter!(
        "orders_discarded_total",
        "Messages acknowledged without processing"
    );
    describe_histogram!(
        "order_processing_duration_seconds",
        "Time from delivery to settlement of an order message"
    );
    describe_gauge!("consumer_in_flight", "Deliveries currently being handled");
}

/// Order pipeline metrics recorder.
pub struct OrderMetrics;

impl OrderMetrics {
    /// Record an order accepted by intake.
    pub fn record_created() {
        counter!("orders_created_total").increment(1);
    }

    /// Record a committed route plan.
    pub fn record_processed(duration: Duration) {
        counter!("orders_processed_total").increment(1);
        histogram!("order_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a delivery for an order that was already processed.
    pub fn record_skipped() {
        counter!("orders_skipped_total").increment(1);
    }

    /// Record a failed attempt.
    pub fn record_failed_attempt(disposition: &'static str) {
        counter!("order_attempts_failed_total", "disposition" => disposition).increment(1);
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered() {
        counter!("orders_dead_lettered_total").increment(1);
    }

    /// Record a discarded message.
    pub fn record_discarded() {
        counter!("orders_discarded_total").increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record the number of deliveries being handled right now.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_in_flight(in_flight: usize) {
        gauge!("consumer_in_flight").set(in_flight as f64);
    }
}
