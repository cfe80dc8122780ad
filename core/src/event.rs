//! Event trait and related types.
//!
//! Events are facts that already happened. They travel over the event bus inside a
//! [`SerializedEvent`] envelope whose payload is `bincode`-encoded.
//!
//! # Example
//!
//! ```
//! use routeminds_core::event::{Event, OrderEvent, SerializedEvent};
//! use routeminds_core::OrderId;
//!
//! let event = OrderEvent::OrderCreated { order_id: OrderId::new(10) };
//! let envelope = SerializedEvent::from_event(&event, None).unwrap();
//! assert_eq!(envelope.event_type, "OrderCreated.v1");
//!
//! let decoded = OrderEvent::from_bytes(&envelope.data).unwrap();
//! assert_eq!(decoded, event);
//! ```

use crate::order::OrderId;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Default topic carrying [`OrderEvent::OrderCreated`].
pub const ORDER_CREATED_TOPIC: &str = "order-created";

/// Error types for event operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered during deserialization.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// An event that can be published on the event bus.
///
/// The `event_type()` string is stable and versioned (`"OrderCreated.v1"`), so
/// consumers can route and reject envelopes before decoding the payload.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to a different event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Events produced by order intake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    /// A new order record was inserted. Carries only the identity; consumers
    /// read the record from the store.
    OrderCreated {
        /// Identity of the inserted order.
        order_id: OrderId,
    },
}

impl OrderEvent {
    /// Event type identifier of [`OrderEvent::OrderCreated`].
    pub const ORDER_CREATED: &'static str = "OrderCreated.v1";

    /// The order this event refers to.
    #[must_use]
    pub const fn order_id(&self) -> OrderId {
        match self {
            Self::OrderCreated { order_id } => *order_id,
        }
    }

    /// Decode an envelope, checking its event type first.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownEventType`] for envelopes of another type and
    /// [`EventError::DeserializationError`] for corrupted payloads.
    pub fn decode(event: &SerializedEvent) -> Result<Self, EventError> {
        match event.event_type.as_str() {
            Self::ORDER_CREATED => Self::from_bytes(&event.data),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::OrderCreated { .. } => Self::ORDER_CREATED,
        }
    }
}

/// A serialized event ready for transport.
///
/// This struct contains the event type name and the serialized bytes,
/// along with optional metadata. It is the wire format between intake,
/// the event bus and the consumer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "OrderCreated.v1").
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata, kept as a JSON string so the envelope stays
    /// bincode-encodable.
    ///
    /// Common metadata fields:
    /// - `correlation_id`: Links related messages
    /// - `published_at`: When the event was published (ISO 8601)
    pub metadata: Option<String>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(event_type: String, data: Vec<u8>, metadata: Option<String>) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an `Event`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata: metadata.map(|m| m.to_string()),
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}
