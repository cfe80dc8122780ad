//! # RouteMinds Testing
//!
//! In-memory test doubles for the capability traits in `routeminds-core`.
//!
//! This crate provides:
//! - [`InMemoryOrderStore`]: write-once order records with failure injection
//! - [`InMemoryCache`]: absolute-expiration cache driven by an injected clock
//! - [`InMemoryEventBus`]: at-least-once bus that redelivers rejected deliveries
//! - [`InMemoryDeadLetterQueue`]: captures dead letters for assertions
//! - Deterministic clocks and order fixtures
//!
//! ## Example
//!
//! ```
//! use routeminds_core::order_store::OrderStore;
//! use routeminds_testing::{InMemoryOrderStore, fixtures};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryOrderStore::new();
//! let order = store.insert(fixtures::berlin_order()).await?;
//! assert!(store.get(order.id).await?.is_some());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use routeminds_core::environment::Clock;

mod cache;
mod dead_letter;
mod event_bus;
mod order_store;

pub use cache::InMemoryCache;
pub use dead_letter::InMemoryDeadLetterQueue;
pub use event_bus::InMemoryEventBus;
pub use order_store::InMemoryOrderStore;

/// Mock clocks for deterministic tests.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use routeminds_testing::mocks::FixedClock;
    /// use routeminds_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to a cache and
    /// advance another.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start the clock at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// The instant every test clock starts at: 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(1_735_689_600)
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }
}

/// Order fixtures.
pub mod fixtures {
    use super::mocks::test_epoch;
    use routeminds_core::NewOrder;
    use rust_decimal::Decimal;

    /// Customer name that trips the processor's fault-injection gate.
    pub const POISON_CUSTOMER: &str = "Joker";

    /// A new order at the given pickup coordinates.
    #[must_use]
    pub fn order_at(customer_name: &str, latitude: f64, longitude: f64) -> NewOrder {
        NewOrder {
            customer_name: customer_name.to_string(),
            delivery_address: format!("{customer_name} Str. 1"),
            latitude,
            longitude,
            package_weight_kg: Decimal::new(1250, 3),
            created_at: test_epoch(),
        }
    }

    /// An order picked up at the Berlin hub's exact coordinates.
    #[must_use]
    pub fn berlin_order() -> NewOrder {
        order_at("Ada Lovelace", 52.52, 13.405)
    }

    /// An order whose customer name is the poison sentinel.
    #[must_use]
    pub fn poison_order() -> NewOrder {
        order_at(POISON_CUSTOMER, 48.1351, 11.5820)
    }
}

pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(mocks::test_epoch());
        let handle = clock.clone();
        handle.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), mocks::test_epoch() + chrono::Duration::seconds(90));
    }
}
