//! The order processor: turns an `OrderCreated` event into a committed and
//! cached route plan.
//!
//! Per message:
//!
//! 1. Decode the envelope and fetch the order record.
//! 2. Run the fault-injection gate (poison sentinel).
//! 3. Skip the message if the record already has a route plan.
//! 4. Assign the nearest hub and build the route plan.
//! 5. Commit the plan to the record store (write-once).
//! 6. Write the committed plan to the cache under `route_<id>` with the TTL.
//!
//! The processor never acknowledges anything itself. It reports an outcome or
//! a [`ProcessError`] whose [`Disposition`] tells the consumer what to do with
//! the message.

use crate::consumer::EventHandler;
use crate::metrics::OrderMetrics;
use routeminds_core::cache::{Cache, CacheError};
use routeminds_core::environment::Clock;
use routeminds_core::event::{EventError, OrderEvent, SerializedEvent};
use routeminds_core::hub::{HubTable, assign_route};
use routeminds_core::order_store::{Commit, OrderStore, OrderStoreError};
use routeminds_core::route_plan::ROUTE_CACHE_TTL;
use routeminds_core::{Order, OrderId, RoutePlan, route_cache_key};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Customer name that makes the processor fail on purpose.
pub const DEFAULT_POISON_SENTINEL: &str = "Joker";

/// What the consumer should do with a message whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient failure: redeliver within the retry budget.
    Retry,
    /// Can never succeed: move to the dead-letter destination now.
    DeadLetter,
    /// Terminal for this message: log and acknowledge.
    Discard,
}

impl Disposition {
    /// Lowercase label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::DeadLetter => "dead_letter",
            Self::Discard => "discard",
        }
    }
}

/// Errors from processing one order message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    /// No record exists for the event's order id.
    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    /// The fault-injection gate matched this order.
    #[error("Simulated failure for order {0}")]
    PoisonMessage(OrderId),

    /// The envelope is not a decodable `OrderCreated` event.
    #[error("Undecodable event: {0}")]
    Decode(#[from] EventError),

    /// Record store failure.
    #[error("Order store error: {0}")]
    Store(#[from] OrderStoreError),

    /// Cache failure.
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// The route plan could not be serialized.
    #[error("Failed to serialize route plan: {0}")]
    Serialization(String),

    /// An attempt ran past the consumer's attempt timeout.
    #[error("Attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl ProcessError {
    /// How the consumer should treat the failed message.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::OrderNotFound(_) => Disposition::Discard,
            Self::Decode(_)
            | Self::Serialization(_)
            | Self::Store(OrderStoreError::Corrupt(_)) => Disposition::DeadLetter,
            Self::PoisonMessage(_) | Self::Store(_) | Self::Cache(_) | Self::TimedOut(_) => {
                Disposition::Retry
            }
        }
    }
}

/// Result of successfully processing a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// A route plan was computed, committed and cached.
    Processed(RoutePlan),
    /// The order already had a route plan; nothing was recomputed.
    AlreadyProcessed(OrderId),
}

/// Processor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Absolute lifetime of cached route plans.
    pub cache_ttl: Duration,
    /// Customer name that triggers a simulated failure. `None` disables the gate.
    pub poison_sentinel: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: ROUTE_CACHE_TTL,
            poison_sentinel: Some(DEFAULT_POISON_SENTINEL.to_string()),
        }
    }
}

impl ProcessorConfig {
    /// Set the cache TTL.
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set or clear the poison sentinel. An empty string clears it.
    #[must_use]
    pub fn with_poison_sentinel(mut self, sentinel: Option<String>) -> Self {
        self.poison_sentinel = sentinel.filter(|s| !s.is_empty());
        self
    }
}

/// Processes `OrderCreated` events against an order store and a cache.
pub struct OrderProcessor<S, C> {
    store: S,
    cache: C,
    hubs: HubTable,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl<S: OrderStore, C: Cache> OrderProcessor<S, C> {
    /// Create a processor over the reference hub table with default settings.
    #[must_use]
    pub fn new(store: S, cache: C, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            cache,
            hubs: HubTable::reference(),
            clock,
            config: ProcessorConfig::default(),
        }
    }

    /// Replace the hub table.
    #[must_use]
    pub fn with_hubs(mut self, hubs: HubTable) -> Self {
        self.hubs = hubs;
        self
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    /// Current settings.
    #[must_use]
    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process one event envelope.
    ///
    /// # Errors
    ///
    /// [`ProcessError::Decode`] for an envelope that is not an `OrderCreated`
    /// event, plus everything [`process_order`](Self::process_order) returns.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn process(&self, event: &SerializedEvent) -> Result<ProcessOutcome, ProcessError> {
        let order_id = OrderEvent::decode(event)?.order_id();
        self.process_order(order_id).await
    }

    /// Process the order with identity `order_id`.
    ///
    /// Safe to call any number of times for the same order: once a plan is
    /// committed, later calls only report [`ProcessOutcome::AlreadyProcessed`].
    ///
    /// # Errors
    ///
    /// - [`ProcessError::OrderNotFound`] if no record exists
    /// - [`ProcessError::PoisonMessage`] if the fault-injection gate matches
    /// - [`ProcessError::Serialization`] if the route distance is not finite
    /// - [`ProcessError::Store`] / [`ProcessError::Cache`] on backend failure
    #[tracing::instrument(skip(self), fields(order_id = %order_id))]
    pub async fn process_order(&self, order_id: OrderId) -> Result<ProcessOutcome, ProcessError> {
        tracing::info!("Processing order");

        let Some(mut order) = self.store.get(order_id).await? else {
            tracing::error!("Order not found in store");
            return Err(ProcessError::OrderNotFound(order_id));
        };

        self.simulate_poison_failure(&order)?;

        if order.is_processed() {
            tracing::warn!("Order already processed, skipping");
            OrderMetrics::record_skipped();
            return Ok(ProcessOutcome::AlreadyProcessed(order_id));
        }

        let plan = assign_route(&self.hubs, &order, self.clock.now());
        // serde_json writes non-finite floats as `null`, which no reader can parse back.
        if !plan.estimated_distance_km.is_finite() {
            tracing::error!(
                latitude = order.latitude,
                longitude = order.longitude,
                "Route distance is not a finite number"
            );
            return Err(ProcessError::Serialization(format!(
                "distance {} km for pickup ({}, {}) is not finite",
                plan.estimated_distance_km, order.latitude, order.longitude
            )));
        }
        tracing::info!(
            hub = %plan.origin,
            distance_km = plan.estimated_distance_km,
            "Hub assigned"
        );

        let payload = plan
            .to_json()
            .map_err(|e| ProcessError::Serialization(e.to_string()))?;
        order.route_plan_json = Some(payload.clone());

        let (committed, outcome) = match self.store.commit(&order).await? {
            Commit::Applied => (payload, ProcessOutcome::Processed(plan)),
            Commit::AlreadyCommitted(stored) => {
                tracing::warn!("Concurrent attempt committed first, caching its route plan");
                (
                    stored.route_plan_json.unwrap_or(payload),
                    ProcessOutcome::AlreadyProcessed(order_id),
                )
            }
        };

        self.cache
            .set(
                &route_cache_key(order_id),
                committed.as_bytes(),
                self.config.cache_ttl,
            )
            .await?;

        tracing::info!("Route plan committed and cached");
        Ok(outcome)
    }

    /// Fault injection for exercising retry and dead-lettering. Remove or
    /// disable through [`ProcessorConfig::poison_sentinel`].
    fn simulate_poison_failure(&self, order: &Order) -> Result<(), ProcessError> {
        match &self.config.poison_sentinel {
            Some(sentinel) if order.customer_name == *sentinel => {
                tracing::error!(customer = %order.customer_name, "Poison sentinel matched, failing on purpose");
                Err(ProcessError::PoisonMessage(order.id))
            }
            _ => Ok(()),
        }
    }
}

impl<S, C> EventHandler for OrderProcessor<S, C>
where
    S: OrderStore + 'static,
    C: Cache + 'static,
{
    fn handle(
        &self,
        event: &SerializedEvent,
    ) -> impl Future<Output = Result<ProcessOutcome, ProcessError>> + Send {
        self.process(event)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use routeminds_core::event::Event;
    use routeminds_testing::{InMemoryCache, InMemoryOrderStore, fixtures, test_clock};

    fn processor() -> (
        OrderProcessor<InMemoryOrderStore, InMemoryCache>,
        InMemoryOrderStore,
        InMemoryCache,
    ) {
        let store = InMemoryOrderStore::new();
        let cache = InMemoryCache::new();
        let processor = OrderProcessor::new(store.clone(), cache.clone(), Arc::new(test_clock()));
        (processor, store, cache)
    }

    fn created(order_id: OrderId) -> SerializedEvent {
        SerializedEvent::from_event(&OrderEvent::OrderCreated { order_id }, None).unwrap()
    }

    #[tokio::test]
    async fn berlin_order_is_committed_and_cached() {
        let (processor, store, cache) = processor();
        let order = store.insert(fixtures::berlin_order()).await.unwrap();

        let outcome = processor.process(&created(order.id)).await.unwrap();
        let ProcessOutcome::Processed(plan) = outcome else {
            unreachable!("first run must compute a route plan");
        };
        assert_eq!(plan.origin, "Berlin Hub");
        assert!(plan.estimated_distance_km.abs() < f64::EPSILON);

        let stored = store.snapshot(order.id).unwrap();
        let payload = stored.route_plan_json.unwrap();
        assert_eq!(
            cache.get(&route_cache_key(order.id)).await.unwrap(),
            Some(payload.into_bytes())
        );
    }

    #[tokio::test]
    async fn second_run_skips_without_recomputing() {
        let (processor, store, _cache) = processor();
        let order = store.insert(fixtures::berlin_order()).await.unwrap();

        processor.process_order(order.id).await.unwrap();
        let before = store.snapshot(order.id).unwrap();

        let outcome = processor.process_order(order.id).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::AlreadyProcessed(order.id));
        assert_eq!(store.snapshot(order.id).unwrap(), before);
        assert_eq!(store.commits_applied(), 1);
    }

    #[tokio::test]
    async fn missing_order_is_discarded() {
        let (processor, _store, cache) = processor();
        let err = processor.process_order(OrderId::new(404)).await.unwrap_err();

        assert_eq!(err, ProcessError::OrderNotFound(OrderId::new(404)));
        assert_eq!(err.disposition(), Disposition::Discard);
        assert!(!cache.contains_key("route_404"));
    }

    #[tokio::test]
    async fn poison_sentinel_fails_before_any_write() {
        let (processor, store, cache) = processor();
        let order = store.insert(fixtures::poison_order()).await.unwrap();

        let err = processor.process_order(order.id).await.unwrap_err();
        assert_eq!(err, ProcessError::PoisonMessage(order.id));
        assert_eq!(err.disposition(), Disposition::Retry);
        assert!(!store.snapshot(order.id).unwrap().is_processed());
        assert!(!cache.contains_key(&route_cache_key(order.id)));
    }

    #[tokio::test]
    async fn disabled_sentinel_processes_normally() {
        let (processor, store, _cache) = processor();
        let processor =
            processor.with_config(ProcessorConfig::default().with_poison_sentinel(Some(String::new())));
        let order = store.insert(fixtures::poison_order()).await.unwrap();

        let outcome = processor.process_order(order.id).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Processed(ref plan) if plan.origin == "Munich Hub"));
    }

    #[tokio::test]
    async fn undecodable_event_goes_to_dead_letter() {
        let (processor, _store, _cache) = processor();
        let event = SerializedEvent::new(OrderEvent::ORDER_CREATED.to_string(), vec![0xff], None);

        let err = processor.process(&event).await.unwrap_err();
        assert!(matches!(err, ProcessError::Decode(_)));
        assert_eq!(err.disposition(), Disposition::DeadLetter);
    }

    #[tokio::test]
    async fn overflowing_coordinates_are_dead_lettered_before_commit() {
        let (processor, store, cache) = processor();
        let order = store
            .insert(fixtures::order_at("Far Away", 1e200, 13.4))
            .await
            .unwrap();

        let err = processor.process_order(order.id).await.unwrap_err();
        assert!(matches!(err, ProcessError::Serialization(_)));
        assert_eq!(err.disposition(), Disposition::DeadLetter);
        assert_eq!(store.snapshot(order.id).unwrap().route_plan_json, None);
        assert_eq!(store.commits_applied(), 0);
        assert!(!cache.contains_key(&route_cache_key(order.id)));
    }

    #[tokio::test]
    async fn commit_failure_is_retryable_and_leaves_cache_empty() {
        let (processor, store, cache) = processor();
        let order = store.insert(fixtures::berlin_order()).await.unwrap();
        store.fail_next_commits(1);

        let err = processor.process_order(order.id).await.unwrap_err();
        assert_eq!(err.disposition(), Disposition::Retry);
        assert!(!cache.contains_key(&route_cache_key(order.id)));

        processor.process_order(order.id).await.unwrap();
        assert!(cache.contains_key(&route_cache_key(order.id)));
    }

    #[tokio::test]
    async fn losing_commit_caches_the_stored_payload() {
        let (processor, store, cache) = processor();
        let order = store.insert(fixtures::berlin_order()).await.unwrap();

        // Another writer commits between our read and our commit.
        let mut winner = order.clone();
        winner.route_plan_json = Some("{\"winner\":true}".to_string());
        store.commit(&winner).await.unwrap();

        let stale = OrderProcessor::new(
            StaleStore(store.clone(), order.clone()),
            cache.clone(),
            Arc::new(test_clock()),
        );
        let outcome = stale.process_order(order.id).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::AlreadyProcessed(order.id));
        assert_eq!(
            cache.get(&route_cache_key(order.id)).await.unwrap(),
            Some(b"{\"winner\":true}".to_vec())
        );
    }

    #[tokio::test]
    async fn cache_write_uses_configured_ttl() {
        let (processor, store, _) = processor();
        let clock = Arc::new(test_clock());
        let cache = InMemoryCache::with_clock(clock.clone());
        let processor = OrderProcessor::new(store.clone(), cache.clone(), clock.clone())
            .with_config(processor.config().clone().with_cache_ttl(Duration::from_secs(60)));
        let order = store.insert(fixtures::berlin_order()).await.unwrap();

        processor.process_order(order.id).await.unwrap();
        assert_eq!(
            cache.expires_at(&route_cache_key(order.id)),
            Some(clock.now() + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn order_created_envelope_carries_type() {
        let event = created(OrderId::new(3));
        let expected = OrderEvent::OrderCreated {
            order_id: OrderId::new(3),
        };
        assert_eq!(event.event_type, expected.event_type());
    }

    /// Serves a fixed, unprocessed snapshot on `get` while committing to the
    /// real store, like a reader that lost a race.
    struct StaleStore(InMemoryOrderStore, Order);

    impl OrderStore for StaleStore {
        async fn get(&self, _id: OrderId) -> routeminds_core::order_store::Result<Option<Order>> {
            Ok(Some(self.1.clone()))
        }

        async fn list(&self) -> routeminds_core::order_store::Result<Vec<Order>> {
            self.0.list().await
        }

        async fn insert(
            &self,
            order: routeminds_core::NewOrder,
        ) -> routeminds_core::order_store::Result<Order> {
            self.0.insert(order).await
        }

        async fn commit(&self, order: &Order) -> routeminds_core::order_store::Result<Commit> {
            self.0.commit(order).await
        }
    }
}
