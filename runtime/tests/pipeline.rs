//! End-to-end pipeline tests over the in-memory doubles.
//!
//! Intake publishes on an at-least-once bus, the consumer drives the
//! processor, and the query path reads back what the processor wrote.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use futures::StreamExt;
use routeminds_core::cache::Cache;
use routeminds_core::event::{ORDER_CREATED_TOPIC, OrderEvent, SerializedEvent};
use routeminds_core::event_bus::{
    Acknowledge, Delivery, DeliveryStream, EventBus, EventBusError,
};
use routeminds_core::order_store::OrderStore;
use routeminds_core::{OrderId, route_cache_key};
use routeminds_runtime::retry::RetryPolicy;
use routeminds_runtime::{
    Consumer, ConsumerConfig, ConsumerHandle, EventHandler, HealthStatus, OrderIntake,
    OrderProcessor, ProcessError, ProcessOutcome, RouteQuery, RouteStatus,
};
use routeminds_testing::{
    InMemoryCache, InMemoryDeadLetterQueue, InMemoryEventBus, InMemoryOrderStore, fixtures,
    test_clock,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Processor = OrderProcessor<InMemoryOrderStore, InMemoryCache>;

struct Pipeline {
    store: InMemoryOrderStore,
    cache: InMemoryCache,
    bus: InMemoryEventBus,
    dead_letters: InMemoryDeadLetterQueue,
    intake: OrderIntake<InMemoryOrderStore>,
    query: RouteQuery<InMemoryOrderStore, InMemoryCache>,
}

impl Pipeline {
    fn new() -> Self {
        let store = InMemoryOrderStore::new();
        let cache = InMemoryCache::new();
        let bus = InMemoryEventBus::new();
        let intake = OrderIntake::new(store.clone(), Arc::new(bus.clone()), Arc::new(test_clock()));
        let query = RouteQuery::new(store.clone(), cache.clone());
        Self {
            store,
            cache,
            bus,
            dead_letters: InMemoryDeadLetterQueue::new(),
            intake,
            query,
        }
    }

    fn processor(&self) -> Processor {
        OrderProcessor::new(self.store.clone(), self.cache.clone(), Arc::new(test_clock()))
    }

    async fn start<H: EventHandler>(&self, handler: H, config: ConsumerConfig) -> ConsumerHandle {
        Consumer::new(
            handler,
            Arc::new(self.bus.clone()),
            Arc::new(self.dead_letters.clone()),
            Arc::new(test_clock()),
        )
        .with_config(config)
        .start()
        .await
        .unwrap()
    }

    async fn start_processor(&self) -> ConsumerHandle {
        self.start(self.processor(), fast_config()).await
    }
}

fn fast_config() -> ConsumerConfig {
    ConsumerConfig::default().with_retry_policy(RetryPolicy::fixed(5, Duration::from_millis(5)))
}

fn created(order_id: OrderId) -> SerializedEvent {
    SerializedEvent::from_event(&OrderEvent::OrderCreated { order_id }, None).unwrap()
}

async fn settle(handle: &ConsumerHandle, expected: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while handle.stats().settled() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("deliveries did not settle in time");
}

#[tokio::test]
async fn berlin_order_flows_from_intake_to_query() {
    let pipeline = Pipeline::new();
    let handle = pipeline.start_processor().await;

    let order = pipeline
        .intake
        .create_order(fixtures::berlin_order())
        .await
        .unwrap();
    settle(&handle, 1).await;

    let RouteStatus::Ready(plan) = pipeline.query.route_status(order.id).await.unwrap() else {
        unreachable!("processed order must have a ready route plan");
    };
    assert_eq!(plan.order_id, order.id);
    assert_eq!(plan.origin, "Berlin Hub");
    assert_eq!(plan.destination, order.delivery_address);
    assert!(plan.estimated_distance_km.abs() < f64::EPSILON);

    let stored = pipeline.store.snapshot(order.id).unwrap();
    let cached = pipeline
        .cache
        .get(&route_cache_key(order.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.route_plan_json.unwrap().into_bytes(), cached);

    assert_eq!(handle.stats().processed, 1);
    assert_eq!(pipeline.bus.acked_count(), 1);
    assert!(handle.health().status.is_healthy());
}

#[tokio::test]
async fn redelivered_event_never_changes_the_payload() {
    let pipeline = Pipeline::new();
    let handle = pipeline.start_processor().await;

    let order = pipeline
        .intake
        .create_order(fixtures::order_at("Grace Hopper", 53.0, 10.0))
        .await
        .unwrap();
    settle(&handle, 1).await;
    let first = pipeline.store.snapshot(order.id).unwrap().route_plan_json;

    pipeline.intake.publish_created(order.id).await.unwrap();
    pipeline.intake.publish_created(order.id).await.unwrap();
    settle(&handle, 3).await;

    assert_eq!(pipeline.store.snapshot(order.id).unwrap().route_plan_json, first);
    assert_eq!(pipeline.store.commits_applied(), 1);
    assert_eq!(handle.stats().skipped, 2);
}

#[tokio::test]
async fn poison_order_is_dead_lettered_after_retry_budget() {
    let pipeline = Pipeline::new();
    let handle = pipeline.start_processor().await;

    let order = pipeline
        .intake
        .create_order(fixtures::poison_order())
        .await
        .unwrap();
    settle(&handle, 1).await;

    let stats = handle.stats();
    assert_eq!(stats.failed_attempts, 6);
    assert_eq!(stats.dead_lettered, 1);

    let entries = pipeline.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 6);
    assert_eq!(entries[0].event, created(order.id));
    assert!(entries[0].first_failed_at <= entries[0].last_failed_at);

    assert!(!pipeline.store.snapshot(order.id).unwrap().is_processed());
    assert!(!pipeline.cache.contains_key(&route_cache_key(order.id)));
    assert_eq!(
        pipeline.query.route_status(order.id).await.unwrap(),
        RouteStatus::Pending
    );
    assert_eq!(handle.health().status, HealthStatus::Degraded);
}

#[tokio::test]
async fn concurrent_duplicates_agree_on_one_payload() {
    let pipeline = Pipeline::new();
    let handle = pipeline.start_processor().await;

    let order = pipeline.store.insert(fixtures::berlin_order()).await.unwrap();
    let event = created(order.id);
    for _ in 0..10 {
        pipeline.bus.publish(ORDER_CREATED_TOPIC, &event).await.unwrap();
    }
    settle(&handle, 10).await;

    let stats = handle.stats();
    assert_eq!(stats.processed + stats.skipped, 10);
    assert_eq!(pipeline.store.commits_applied(), 1);

    let stored = pipeline.store.snapshot(order.id).unwrap().route_plan_json.unwrap();
    let cached = pipeline
        .cache
        .get(&route_cache_key(order.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.into_bytes(), cached);
}

#[tokio::test]
async fn unknown_order_is_discarded_not_retried() {
    let pipeline = Pipeline::new();
    let handle = pipeline.start_processor().await;

    pipeline
        .bus
        .publish(ORDER_CREATED_TOPIC, &created(OrderId::new(999)))
        .await
        .unwrap();
    settle(&handle, 1).await;

    let stats = handle.stats();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.failed_attempts, 1);
    assert!(pipeline.dead_letters.is_empty());
    assert_eq!(pipeline.bus.acked_count(), 1);
    assert_eq!(pipeline.bus.rejected_count(), 0);
}

#[tokio::test]
async fn cache_failure_after_commit_still_reads_as_ready() {
    let pipeline = Pipeline::new();
    let handle = pipeline.start_processor().await;
    pipeline.cache.fail_next_sets(1);

    let order = pipeline
        .intake
        .create_order(fixtures::berlin_order())
        .await
        .unwrap();
    settle(&handle, 1).await;

    // The retry sees the committed payload and skips; the cache stays empty.
    assert_eq!(handle.stats().skipped, 1);
    assert!(!pipeline.cache.contains_key(&route_cache_key(order.id)));

    let stored = pipeline.store.snapshot(order.id).unwrap();
    let expected = stored.route_plan().unwrap().unwrap();
    assert_eq!(
        pipeline.query.route_status(order.id).await.unwrap(),
        RouteStatus::Ready(expected)
    );
}

/// Holds every message for a while and records how many run at once.
struct Slow<H> {
    inner: H,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl<H: EventHandler> EventHandler for Slow<H> {
    async fn handle(&self, event: &SerializedEvent) -> Result<ProcessOutcome, ProcessError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = self.inner.handle(event).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_the_limit() {
    let pipeline = Pipeline::new();
    let peak = Arc::new(AtomicUsize::new(0));
    let handler = Slow {
        inner: pipeline.processor(),
        active: Arc::new(AtomicUsize::new(0)),
        peak: Arc::clone(&peak),
    };
    let handle = pipeline.start(handler, fast_config()).await;

    for i in 0..30 {
        let latitude = 47.0 + f64::from(i) * 0.1;
        pipeline
            .intake
            .create_order(fixtures::order_at(&format!("customer {i}"), latitude, 10.0))
            .await
            .unwrap();
    }
    settle(&handle, 30).await;

    assert_eq!(handle.stats().processed, 30);
    assert!(peak.load(Ordering::SeqCst) <= 5);
    assert!(peak.load(Ordering::SeqCst) > 1);
    assert!(handle.stats().max_in_flight <= 5);
}

/// Passes the in-memory bus through and counts deliveries handed to the
/// consumer that it has not settled yet.
#[derive(Clone)]
struct Unsettled {
    inner: InMemoryEventBus,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Unsettled {
    fn new(inner: InMemoryEventBus) -> Self {
        Self {
            inner,
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct Settle {
    delivery: Delivery,
    current: Arc<AtomicUsize>,
}

impl Acknowledge for Settle {
    fn ack(self: Box<Self>) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.delivery.ack();
    }

    fn reject(self: Box<Self>) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.delivery.reject();
    }
}

impl EventBus for Unsettled {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        self.inner.publish(topic, event)
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let subscription = self.inner.subscribe(topics);
        let current = Arc::clone(&self.current);
        let peak = Arc::clone(&self.peak);

        Box::pin(async move {
            let stream = subscription.await?.map(move |next| {
                next.map(|delivery| {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    Delivery::new(
                        delivery.event.clone(),
                        delivery.delivery_count,
                        Box::new(Settle {
                            delivery,
                            current: Arc::clone(&current),
                        }),
                    )
                })
            });
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

#[tokio::test]
async fn unsettled_deliveries_never_exceed_prefetch() {
    let pipeline = Pipeline::new();
    let bus = Unsettled::new(pipeline.bus.clone());
    let handler = Slow {
        inner: pipeline.processor(),
        active: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
    };
    let handle = Consumer::new(
        handler,
        Arc::new(bus.clone()),
        Arc::new(pipeline.dead_letters.clone()),
        Arc::new(test_clock()),
    )
    .with_config(fast_config().with_concurrency(2).with_prefetch(10))
    .start()
    .await
    .unwrap();

    for i in 0..40 {
        let latitude = 47.0 + f64::from(i) * 0.1;
        pipeline
            .intake
            .create_order(fixtures::order_at(&format!("customer {i}"), latitude, 10.0))
            .await
            .unwrap();
    }
    settle(&handle, 40).await;

    let stats = handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(stats.processed, 40);
    assert!(stats.max_in_flight <= 2);
    assert_eq!(bus.peak.load(Ordering::SeqCst), 10);
    assert_eq!(bus.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_releases_unstarted_deliveries_for_redelivery() {
    let pipeline = Pipeline::new();
    let handler = Slow {
        inner: pipeline.processor(),
        active: Arc::new(AtomicUsize::new(0)),
        peak: Arc::new(AtomicUsize::new(0)),
    };
    let config = fast_config().with_concurrency(1).with_prefetch(4);
    let handle = pipeline.start(handler, config).await;

    for i in 0..4 {
        pipeline
            .intake
            .create_order(fixtures::order_at(&format!("customer {i}"), 50.0, 10.0))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    let stats = handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(stats.in_flight, 0);
    assert!(stats.processed < 4);
    assert_eq!(u64::try_from(pipeline.bus.acked_count()).unwrap(), stats.processed);
    assert!(pipeline.bus.rejected_count() >= 1);
}
