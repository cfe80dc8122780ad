//! Event bus abstraction.
//!
//! The [`EventBus`] trait decouples order intake from order processing. Intake
//! persists the order first and publishes second; the consumer receives each
//! event as a [`Delivery`] that must be settled.
//!
//! # Key Principles
//!
//! - **Store first**: the order record exists before its event is published
//! - **At-least-once delivery**: events may be delivered multiple times
//! - **Explicit settlement**: a delivery is acknowledged with [`Delivery::ack`];
//!   dropping it unacknowledged (crash, cancellation, shutdown) rejects it and the
//!   transport redelivers it later
//! - **Idempotency**: subscribers must tolerate duplicates
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `routeminds-testing` - for tests
//! - `RedpandaEventBus` in `routeminds-redpanda` - for production (Kafka-compatible)

use crate::event::SerializedEvent;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Failed to deserialize an event
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Settles a single delivery with the transport.
///
/// Exactly one of the two methods is called per delivery.
pub trait Acknowledge: Send {
    /// The consumer is done with the message; do not deliver it again.
    fn ack(self: Box<Self>);

    /// The consumer gave up on the message without finishing; redeliver it.
    fn reject(self: Box<Self>);
}

/// One delivery of an event to a subscriber.
///
/// Dropping a `Delivery` without calling [`Delivery::ack`] rejects it.
pub struct Delivery {
    /// The delivered event.
    pub event: SerializedEvent,
    /// How many times the transport has handed this event out, starting at 1.
    pub delivery_count: u32,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    /// Wrap an event with the transport's settlement handle.
    #[must_use]
    pub fn new(event: SerializedEvent, delivery_count: u32, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            event,
            delivery_count,
            acker: Some(acker),
        }
    }

    /// A delivery with nothing to settle, for transports without acknowledgements.
    #[must_use]
    pub const fn unacknowledged(event: SerializedEvent) -> Self {
        Self {
            event,
            delivery_count: 1,
            acker: None,
        }
    }

    /// Whether this is a redelivery of an event handed out before.
    #[must_use]
    pub const fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }

    /// Acknowledge successful consumption.
    pub fn ack(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.ack();
        }
    }

    /// Explicitly reject the delivery so the transport redelivers it.
    pub fn reject(mut self) {
        if let Some(acker) = self.acker.take() {
            acker.reject();
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            acker.reject();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("event", &self.event)
            .field("delivery_count", &self.delivery_count)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn EventBus>` between intake and the consumer.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        event: &SerializedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of deliveries.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, EventBusError>> + Send + '_>>;
}
