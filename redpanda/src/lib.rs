//! Redpanda event bus for the RouteMinds pipeline.
//!
//! [`RedpandaEventBus`] implements the [`EventBus`] trait from `routeminds-core`
//! on top of rdkafka, so it works against Redpanda or any Kafka-compatible
//! broker.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Every message is handed to the subscriber as a [`Delivery`]
//! - Offsets are committed only after the delivery is acknowledged, and never
//!   past a delivery that is still outstanding in the same partition
//! - A rejected (or dropped) delivery keeps its partition's position where it
//!   is; the message is delivered again after a restart or rebalance
//! - Subscribers MUST be idempotent
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use routeminds_core::event::SerializedEvent;
//! use routeminds_core::event_bus::EventBus;
//! use routeminds_redpanda::RedpandaEventBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("routeminds-order-processor")
//!     .build()?;
//!
//! let event = SerializedEvent::new("OrderCreated.v1".to_string(), vec![1, 2, 3], None);
//! event_bus.publish("order-created", &event).await?;
//!
//! let mut deliveries = event_bus.subscribe(&["order-created"]).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received: {}", delivery.event.event_type);
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod offsets;

use offsets::OffsetTracker;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use routeminds_core::event::SerializedEvent;
use routeminds_core::event_bus::{
    Acknowledge, Delivery, DeliveryStream, EventBus, EventBusError,
};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// Redpanda event bus.
///
/// Publishing goes through one shared [`FutureProducer`]. Each call to
/// [`EventBus::subscribe`] creates its own consumer in the configured group,
/// so several subscriptions (or several worker processes) share the
/// partitions of a topic.
///
/// # Example
///
/// ```no_run
/// use routeminds_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaEventBus {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    consumer_group: Option<String>,
    buffer_size: usize,
    auto_offset_reset: String,
}

impl RedpandaEventBus {
    /// Create an event bus with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Bootstrap servers this bus connects to.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn group_id(&self, topics: &[String]) -> String {
        self.consumer_group.clone().unwrap_or_else(|| {
            let mut sorted = topics.to_vec();
            sorted.sort();
            format!("routeminds-{}", sorted.join("-"))
        })
    }
}

impl std::fmt::Debug for RedpandaEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaEventBus")
            .field("brokers", &self.brokers)
            .field("consumer_group", &self.consumer_group)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Comma-separated broker addresses, e.g. `"localhost:9092"`.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consumer group shared by every subscription of this bus.
    ///
    /// If not set, the group id is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Deliveries buffered between the broker and the subscriber.
    ///
    /// Default: 100. A value of 0 is treated as 1.
    #[must_use]
    pub const fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    /// Where a group without a committed offset starts reading:
    /// `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: `"earliest"`, so orders published before the first worker
    /// started are still routed.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the brokers are not set
    /// or the producer configuration is rejected.
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());
        let compression = self.compression.unwrap_or_else(|| "none".to_string());
        let buffer_size = self.buffer_size.unwrap_or(100).max(1);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", &acks)
            .set("compression.type", &compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks = %acks,
            compression = %compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let event = event.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let payload = bincode::serialize(&event).map_err(|e| EventBusError::PublishFailed {
                topic: topic.clone(),
                reason: format!("Failed to serialize event: {e}"),
            })?;

            let record = FutureRecord::to(&topic)
                .payload(&payload)
                .key(event.event_type.as_bytes());

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        event_type = %event.event_type,
                        "Event published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish event");
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();

        Box::pin(async move {
            let group_id = self.group_id(&topics);
            let subscription_failed = |reason: String| EventBusError::SubscriptionFailed {
                topics: topics.clone(),
                reason,
            };

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| subscription_failed(format!("Failed to subscribe to topics: {e}")))?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %group_id,
                buffer_size = self.buffer_size,
                auto_offset_reset = %self.auto_offset_reset,
                "Subscribed to topics"
            );

            let (tx, rx) = mpsc::channel(self.buffer_size);
            tokio::spawn(pump(consumer, tx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Reject,
}

/// A settled delivery, reported back to the task that owns the consumer.
#[derive(Debug)]
struct Settled {
    topic: String,
    partition: i32,
    offset: i64,
    settlement: Settlement,
}

/// Settles one Kafka message by reporting its offset to [`pump`].
struct KafkaAcker {
    topic: String,
    partition: i32,
    offset: i64,
    settled: mpsc::UnboundedSender<Settled>,
}

impl KafkaAcker {
    fn settle(self, settlement: Settlement) {
        let settled = Settled {
            topic: self.topic,
            partition: self.partition,
            offset: self.offset,
            settlement,
        };
        // The consumer task is gone: the offset stays uncommitted.
        let _ = self.settled.send(settled);
    }
}

impl Acknowledge for KafkaAcker {
    fn ack(self: Box<Self>) {
        self.settle(Settlement::Ack);
    }

    fn reject(self: Box<Self>) {
        self.settle(Settlement::Reject);
    }
}

fn decode(message: &BorrowedMessage<'_>) -> Result<SerializedEvent, EventBusError> {
    let payload = message
        .payload()
        .ok_or_else(|| EventBusError::DeserializationFailed("Message has no payload".to_string()))?;
    bincode::deserialize(payload)
        .map_err(|e| EventBusError::DeserializationFailed(format!("Failed to deserialize event: {e}")))
}

/// Owns the consumer: forwards messages as deliveries and commits offsets as
/// the deliveries are acknowledged.
async fn pump(consumer: StreamConsumer, tx: mpsc::Sender<Result<Delivery, EventBusError>>) {
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel();
    let mut offsets = OffsetTracker::default();

    loop {
        tokio::select! {
            biased;
            Some(settled) = settled_rx.recv() => {
                apply(&consumer, &mut offsets, &settled);
            }
            () = tx.closed() => {
                tracing::debug!("Subscriber dropped the delivery stream");
                break;
            }
            received = consumer.recv() => {
                let item = match received {
                    Ok(message) => {
                        let topic = message.topic().to_string();
                        let partition = message.partition();
                        let offset = message.offset();
                        offsets.track(&topic, partition, offset);

                        match decode(&message) {
                            Ok(event) => {
                                tracing::trace!(
                                    topic = %topic,
                                    partition,
                                    offset,
                                    event_type = %event.event_type,
                                    "Received event"
                                );
                                Ok(Delivery::new(
                                    event,
                                    1,
                                    Box::new(KafkaAcker {
                                        topic,
                                        partition,
                                        offset,
                                        settled: settled_tx.clone(),
                                    }),
                                ))
                            }
                            Err(error) => {
                                // Unreadable envelopes can never be processed; step past them.
                                tracing::warn!(
                                    topic = %topic,
                                    partition,
                                    offset,
                                    error = %error,
                                    "Skipping undecodable message"
                                );
                                apply(
                                    &consumer,
                                    &mut offsets,
                                    &Settled { topic, partition, offset, settlement: Settlement::Ack },
                                );
                                Err(error)
                            }
                        }
                    }
                    Err(e) => Err(EventBusError::TransportError(format!(
                        "Failed to receive message: {e}"
                    ))),
                };

                if tx.send(item).await.is_err() {
                    tracing::debug!("Subscriber dropped the delivery stream");
                    break;
                }
            }
        }
    }

    // Commit whatever was acknowledged before the stream went away.
    while let Ok(settled) = settled_rx.try_recv() {
        apply(&consumer, &mut offsets, &settled);
    }

    tracing::debug!(
        uncommitted = offsets.outstanding(),
        "Consumer task exiting"
    );
}

fn apply(consumer: &StreamConsumer, offsets: &mut OffsetTracker, settled: &Settled) {
    if settled.settlement == Settlement::Reject {
        tracing::debug!(
            topic = %settled.topic,
            partition = settled.partition,
            offset = settled.offset,
            "Delivery rejected; partition position held until redelivery"
        );
        return;
    }

    let Some(position) = offsets.ack(&settled.topic, settled.partition, settled.offset) else {
        return;
    };

    let mut positions = TopicPartitionList::new();
    if let Err(e) =
        positions.add_partition_offset(&settled.topic, settled.partition, Offset::Offset(position))
    {
        tracing::warn!(error = %e, "Invalid commit position");
        return;
    }

    if let Err(e) = consumer.commit(&positions, CommitMode::Async) {
        tracing::warn!(
            topic = %settled.topic,
            partition = settled.partition,
            position,
            error = %e,
            "Failed to commit offset (messages may be redelivered)"
        );
    } else {
        tracing::trace!(
            topic = %settled.topic,
            partition = settled.partition,
            position,
            "Offset committed"
        );
    }
}
