//! # RouteMinds Runtime
//!
//! The moving parts of the order pipeline, written against the capability
//! traits of `routeminds-core` so they run unchanged over Postgres, Redis and
//! Redpanda in production and over in-memory doubles in tests.
//!
//! ## Core Components
//!
//! - [`OrderIntake`]: stores a new order, then publishes `OrderCreated`
//! - [`OrderProcessor`]: fetch, gate, skip-if-done, assign hub, commit, cache
//! - [`Consumer`]: bounded-concurrency harness with retry and dead-lettering
//! - [`RouteQuery`]: order lookups and route plan status
//! - [`health`], [`metrics`], [`retry`]: operational support
//!
//! ## Example
//!
//! ```ignore
//! use routeminds_runtime::{Consumer, ConsumerConfig, OrderProcessor};
//!
//! let processor = OrderProcessor::new(store, cache, clock.clone());
//! let handle = Consumer::new(processor, bus, dead_letters, clock)
//!     .with_config(ConsumerConfig::default())
//!     .start()
//!     .await?;
//!
//! // ... later
//! handle.shutdown(Duration::from_secs(30)).await?;
//! ```

/// Consumption harness
pub mod consumer;

/// Health reporting
pub mod health;

/// Order intake
pub mod intake;

/// Prometheus metrics for observability
pub mod metrics;

/// The order processor
pub mod processor;

/// Read path
pub mod query;

/// Retry policy
pub mod retry;

pub use consumer::{
    Consumer, ConsumerConfig, ConsumerError, ConsumerHandle, ConsumerStatsSnapshot, EventHandler,
};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use intake::{IntakeError, OrderIntake};
pub use processor::{
    Disposition, OrderProcessor, ProcessError, ProcessOutcome, ProcessorConfig,
};
pub use query::{QueryError, RouteQuery, RouteStatus};
pub use retry::RetryPolicy;
