//! # RouteMinds Core
//!
//! Domain types and capability traits for the RouteMinds order-fulfillment pipeline.
//!
//! This crate is I/O free. It defines:
//!
//! - **Orders**: the durable [`Order`](order::Order) record and its write-once route plan payload
//! - **Route plans**: the cacheable [`RoutePlan`](route_plan::RoutePlan) document and its wire shape
//! - **Hub assignment**: the pure nearest-hub engine ([`hub::assign_route`])
//! - **Events**: the `OrderCreated` event and its serialized envelope
//! - **Capabilities**: [`OrderStore`](order_store::OrderStore), [`Cache`](cache::Cache),
//!   [`EventBus`](event_bus::EventBus), [`DeadLetterSink`](dead_letter::DeadLetterSink)
//!   and [`Clock`](environment::Clock), injected into the runtime so every
//!   adapter can be swapped for an in-memory double.
//!
//! ## Data flow
//!
//! ```text
//! Intake ──insert──▶ OrderStore
//!    │
//!    └──publish──▶ EventBus ──deliver──▶ OrderProcessor ──commit──▶ OrderStore
//!                                             │
//!                                             └──set(route_<id>, 1h)──▶ Cache ◀── readers
//! ```

pub use chrono::{DateTime, Utc};

/// Key-value cache with absolute expiration
pub mod cache;

/// Dead-letter destination for messages that exhausted their retry budget
pub mod dead_letter;

/// Event trait, serialized envelope and order events
pub mod event;

/// At-least-once event bus abstraction
pub mod event_bus;

/// Hub table and nearest-hub assignment
pub mod hub;

/// Order record types
pub mod order;

/// Durable order record storage abstraction
pub mod order_store;

/// Route plan document and cache key format
pub mod route_plan;

/// Environment module - injected dependencies that are not storage
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use routeminds_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time from the operating system.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use order::{NewOrder, Order, OrderId};
pub use route_plan::{RoutePlan, route_cache_key};
