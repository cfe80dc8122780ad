//! Consumption harness: pulls deliveries from the event bus and drives an
//! [`EventHandler`] with bounded concurrency, retries and dead-lettering.
//!
//! # Flow control
//!
//! - At most `prefetch` deliveries are held unacknowledged at any time
//!   (buffered plus in flight). The reader takes one credit per delivery and
//!   the credit is returned only when the delivery is settled.
//! - At most `concurrency` deliveries are handled at once, one per worker task.
//!
//! # Settlement
//!
//! | Result | Action |
//! |---|---|
//! | success | ack |
//! | [`Disposition::Retry`] | retry on the same worker at a fixed interval; once the budget is spent, dead-letter then ack |
//! | [`Disposition::DeadLetter`] | dead-letter then ack |
//! | [`Disposition::Discard`] | log then ack |
//!
//! If the dead-letter write itself fails the delivery is rejected, so the
//! transport hands it out again instead of losing it.

use crate::health::HealthCheck;
use crate::metrics::{ConsumerMetrics, OrderMetrics};
use crate::processor::{Disposition, ProcessError, ProcessOutcome};
use crate::retry::{RetryError, RetryPolicy, retry_with_predicate};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use routeminds_core::dead_letter::{DeadLetter, DeadLetterSink};
use routeminds_core::environment::Clock;
use routeminds_core::event::{ORDER_CREATED_TOPIC, OrderEvent, SerializedEvent};
use routeminds_core::event_bus::{Delivery, DeliveryStream, EventBus, EventBusError};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

const COMPONENT: &str = "order-consumer";

/// Handles one event envelope.
///
/// Implementations must be idempotent: the harness can hand the same event
/// out more than once.
pub trait EventHandler: Send + Sync + 'static {
    /// Handle `event`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProcessError`] whose disposition decides the message's fate.
    fn handle(
        &self,
        event: &SerializedEvent,
    ) -> impl Future<Output = Result<ProcessOutcome, ProcessError>> + Send;
}

/// Errors from starting or stopping a consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// The configuration cannot be run.
    #[error("Invalid consumer configuration: {0}")]
    InvalidConfig(String),

    /// Subscribing to the topic failed.
    #[error("Subscription failed: {0}")]
    Subscribe(#[from] EventBusError),

    /// In-flight deliveries did not finish in time; remaining tasks were aborted.
    #[error("Consumer shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// A consumer task panicked.
    #[error("Consumer task failed: {0}")]
    TaskFailed(String),
}

/// Consumer settings.
///
/// # Default Values
///
/// - `topic`: `order-created`
/// - `concurrency`: 5
/// - `prefetch`: 10
/// - `retry_policy`: 5 retries, 1 second apart
/// - `attempt_timeout`: 30 seconds
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Topic to subscribe to
    pub topic: String,
    /// Maximum deliveries handled at once
    pub concurrency: usize,
    /// Maximum deliveries held unacknowledged
    pub prefetch: usize,
    /// Retry policy for failed attempts
    pub retry_policy: RetryPolicy,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: ORDER_CREATED_TOPIC.to_string(),
            concurrency: 5,
            prefetch: 10,
            retry_policy: RetryPolicy::fixed(5, Duration::from_secs(1)),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl ConsumerConfig {
    /// Set the topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the concurrency limit.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the prefetch limit.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), ConsumerError> {
        if self.topic.is_empty() {
            return Err(ConsumerError::InvalidConfig("topic must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(ConsumerError::InvalidConfig("concurrency must be at least 1".to_string()));
        }
        if self.prefetch == 0 || self.prefetch > Semaphore::MAX_PERMITS {
            return Err(ConsumerError::InvalidConfig(format!(
                "prefetch must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.prefetch < self.concurrency {
            tracing::warn!(
                prefetch = self.prefetch,
                concurrency = self.concurrency,
                "Prefetch below concurrency, some workers will idle"
            );
        }
        Ok(())
    }
}

/// Counters kept by a running consumer.
#[derive(Debug, Default)]
struct ConsumerStats {
    processed: AtomicU64,
    skipped: AtomicU64,
    failed_attempts: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_failures: AtomicU64,
    discarded: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stream_ended: AtomicBool,
}

impl ConsumerStats {
    fn begin(&self) -> usize {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        in_flight
    }

    fn end(&self) -> usize {
        self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            processed: self.processed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed_attempts: self.failed_attempts.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
            dead_letter_failures: self.dead_letter_failures.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
            stream_ended: self.stream_ended.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time view of a consumer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    /// Deliveries that produced a new route plan
    pub processed: u64,
    /// Deliveries for orders that were already processed
    pub skipped: u64,
    /// Failed attempts, including ones later retried successfully
    pub failed_attempts: u64,
    /// Deliveries moved to the dead-letter destination
    pub dead_lettered: u64,
    /// Dead-letter writes that failed
    pub dead_letter_failures: u64,
    /// Deliveries acknowledged without processing
    pub discarded: u64,
    /// Deliveries being handled right now
    pub in_flight: usize,
    /// Highest number of deliveries handled at once
    pub max_in_flight: usize,
    /// Whether the subscription stream has ended
    pub stream_ended: bool,
}

impl ConsumerStatsSnapshot {
    /// Deliveries that have been acknowledged or dead-lettered.
    #[must_use]
    pub const fn settled(&self) -> u64 {
        self.processed + self.skipped + self.dead_lettered + self.discarded
    }
}

/// Subscribes a handler to a topic.
pub struct Consumer<H> {
    handler: H,
    bus: Arc<dyn EventBus>,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
}

impl<H: EventHandler> Consumer<H> {
    /// Create a consumer with default settings.
    #[must_use]
    pub fn new(
        handler: H,
        bus: Arc<dyn EventBus>,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            handler,
            bus,
            dead_letters,
            clock,
            config: ConsumerConfig::default(),
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe and spawn the reader and worker tasks.
    ///
    /// Must be called from within a Tokio runtime. Dropping the returned
    /// handle stops the consumer without waiting for in-flight deliveries.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::InvalidConfig`] for unusable limits
    /// - [`ConsumerError::Subscribe`] if the bus refuses the subscription
    pub async fn start(self) -> Result<ConsumerHandle, ConsumerError> {
        self.config.validate()?;

        let stream = self.bus.subscribe(&[self.config.topic.as_str()]).await?;
        let stats = Arc::new(ConsumerStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::channel(self.config.prefetch);
        let credits = Arc::new(Semaphore::new(self.config.prefetch));

        let reader = tokio::spawn(read_deliveries(
            stream,
            work_tx,
            credits,
            Arc::clone(&stats),
            shutdown_rx.clone(),
        ));

        tracing::info!(
            topic = %self.config.topic,
            concurrency = self.config.concurrency,
            prefetch = self.config.prefetch,
            max_retries = self.config.retry_policy.max_retries,
            "Consumer started"
        );

        let concurrency = self.config.concurrency;
        let queue = Arc::new(Mutex::new(work_rx));
        let worker = Arc::new(Worker {
            handler: self.handler,
            dead_letters: self.dead_letters,
            clock: self.clock,
            config: self.config,
            stats: Arc::clone(&stats),
        });

        let workers = (0..concurrency)
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&worker),
                    Arc::clone(&queue),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            reader,
            workers,
            stats,
        })
    }
}

/// Handle to a running consumer.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHandle {
    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Consumer health: degraded once anything was dead-lettered, unhealthy
    /// once the subscription stream has ended.
    #[must_use]
    pub fn health(&self) -> HealthCheck {
        let stats = self.stats.snapshot();
        let check = if stats.stream_ended {
            HealthCheck::unhealthy(COMPONENT, "subscription stream ended")
        } else if stats.dead_letter_failures > 0 {
            HealthCheck::degraded(
                COMPONENT,
                format!("{} dead-letter writes failed", stats.dead_letter_failures),
            )
        } else if stats.dead_lettered > 0 {
            HealthCheck::degraded(
                COMPONENT,
                format!("{} messages dead-lettered", stats.dead_lettered),
            )
        } else {
            HealthCheck::healthy(COMPONENT)
        };

        check
            .with_metadata("processed", stats.processed)
            .with_metadata("skipped", stats.skipped)
            .with_metadata("discarded", stats.discarded)
            .with_metadata("in_flight", stats.in_flight)
    }

    /// Stop pulling deliveries and wait for in-flight ones to settle.
    ///
    /// Deliveries that were buffered but not started are released
    /// unacknowledged, so the transport redelivers them later.
    ///
    /// # Errors
    ///
    /// - [`ConsumerError::ShutdownTimeout`] if in-flight deliveries outlive
    ///   `timeout`; the remaining tasks are aborted
    /// - [`ConsumerError::TaskFailed`] if a task panicked
    pub async fn shutdown(self, timeout: Duration) -> Result<ConsumerStatsSnapshot, ConsumerError> {
        tracing::info!("Initiating consumer shutdown");
        self.shutdown.send_replace(true);

        let mut tasks = self.workers;
        tasks.push(self.reader);
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        let Ok(results) = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await
        else {
            for abort in aborts {
                abort.abort();
            }
            let in_flight = self.stats.in_flight.load(Ordering::SeqCst);
            tracing::error!(in_flight, "Consumer shutdown timed out");
            return Err(ConsumerError::ShutdownTimeout(timeout));
        };

        if let Some(failure) = results.into_iter().find_map(Result::err) {
            return Err(ConsumerError::TaskFailed(failure.to_string()));
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            processed = stats.processed,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        Ok(stats)
    }
}

/// A delivery together with the prefetch credit it holds.
struct Work {
    delivery: Delivery,
    credit: OwnedSemaphorePermit,
}

async fn read_deliveries(
    mut stream: DeliveryStream,
    work: mpsc::Sender<Work>,
    credits: Arc<Semaphore>,
    stats: Arc<ConsumerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let credit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            credit = Arc::clone(&credits).acquire_owned() => match credit {
                Ok(credit) => credit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                if delivery.is_redelivery() {
                    tracing::debug!(
                        delivery_count = delivery.delivery_count,
                        "Received redelivered message"
                    );
                }
                if work.send(Work { delivery, credit }).await.is_err() {
                    break;
                }
            }
            Some(Err(error)) => {
                tracing::warn!(error = %error, "Subscription error");
            }
            None => {
                tracing::warn!("Subscription stream ended");
                stats.stream_ended.store(true, Ordering::SeqCst);
                break;
            }
        }
    }

    tracing::debug!("Delivery reader stopped");
}

async fn run_worker<H: EventHandler>(
    id: usize,
    worker: Arc<Worker<H>>,
    queue: Arc<Mutex<mpsc::Receiver<Work>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let work = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                work = queue.recv() => work,
            }
        };

        let Some(Work { delivery, credit }) = work else {
            break;
        };
        worker.handle_delivery(delivery).await;
        drop(credit);
    }

    tracing::debug!(worker = id, "Worker stopped");
}

struct Worker<H> {
    handler: H,
    dead_letters: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

impl<H: EventHandler> Worker<H> {
    async fn handle_delivery(&self, delivery: Delivery) {
        let started = Instant::now();
        ConsumerMetrics::record_in_flight(self.stats.begin());

        let order_id = OrderEvent::decode(&delivery.event)
            .ok()
            .map(|event| event.order_id());
        let first_failure = std::sync::Mutex::new(None::<DateTime<Utc>>);

        let result = {
            let handler = &self.handler;
            let event = &delivery.event;
            let stats = &*self.stats;
            let clock = &*self.clock;
            let first_failure = &first_failure;
            let timeout = self.config.attempt_timeout;

            retry_with_predicate(
                self.config.retry_policy.clone(),
                move || async move {
                    let result = tokio::time::timeout(timeout, handler.handle(event))
                        .await
                        .unwrap_or(Err(ProcessError::TimedOut(timeout)));

                    if let Err(error) = &result {
                        stats.failed_attempts.fetch_add(1, Ordering::SeqCst);
                        OrderMetrics::record_failed_attempt(error.disposition().as_str());
                        first_failure
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get_or_insert_with(|| clock.now());
                    }
                    result
                },
                |error: &ProcessError| error.disposition() == Disposition::Retry,
            )
            .await
        };

        match result {
            Ok(ProcessOutcome::Processed(_)) => {
                self.stats.processed.fetch_add(1, Ordering::SeqCst);
                OrderMetrics::record_processed(started.elapsed());
                delivery.ack();
            }
            Ok(ProcessOutcome::AlreadyProcessed(_)) => {
                self.stats.skipped.fetch_add(1, Ordering::SeqCst);
                delivery.ack();
            }
            Err(RetryError::Aborted { error, attempts })
                if error.disposition() == Disposition::Discard =>
            {
                tracing::error!(
                    order_id = ?order_id,
                    attempts,
                    error = %error,
                    "Discarding message"
                );
                self.stats.discarded.fetch_add(1, Ordering::SeqCst);
                OrderMetrics::record_discarded();
                delivery.ack();
            }
            Err(failure) => {
                let attempts = failure.attempts();
                let error = failure.into_error();
                let last_failed_at = self.clock.now();
                let first_failed_at = first_failure
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .unwrap_or(last_failed_at);

                let entry = DeadLetter {
                    topic: self.config.topic.clone(),
                    event: delivery.event.clone(),
                    error_message: error.to_string(),
                    attempts,
                    first_failed_at,
                    last_failed_at,
                };
                self.dead_letter(delivery, entry).await;
            }
        }

        ConsumerMetrics::record_in_flight(self.stats.end());
    }

    async fn dead_letter(&self, delivery: Delivery, entry: DeadLetter) {
        let attempts = entry.attempts;
        let error_message = entry.error_message.clone();

        match self.dead_letters.dead_letter(entry).await {
            Ok(()) => {
                tracing::error!(
                    attempts,
                    error = %error_message,
                    delivery_count = delivery.delivery_count,
                    "Message moved to dead-letter queue"
                );
                self.stats.dead_lettered.fetch_add(1, Ordering::SeqCst);
                OrderMetrics::record_dead_lettered();
                delivery.ack();
            }
            Err(sink_error) => {
                tracing::error!(
                    attempts,
                    error = %error_message,
                    sink_error = %sink_error,
                    "Failed to dead-letter message, leaving it for redelivery"
                );
                self.stats.dead_letter_failures.fetch_add(1, Ordering::SeqCst);
                delivery.reject();
            }
        }
    }
}
