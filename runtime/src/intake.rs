//! Order intake: persists a new order, then announces it on the bus.

use crate::metrics::OrderMetrics;
use routeminds_core::environment::Clock;
use routeminds_core::event::{EventError, ORDER_CREATED_TOPIC, OrderEvent, SerializedEvent};
use routeminds_core::event_bus::{EventBus, EventBusError};
use routeminds_core::order_store::{OrderStore, OrderStoreError};
use routeminds_core::{NewOrder, Order, OrderId};
use std::sync::Arc;
use thiserror::Error;

/// Errors from accepting an order.
#[derive(Error, Debug)]
pub enum IntakeError {
    /// The order could not be stored. Nothing was published.
    #[error("Failed to store order: {0}")]
    Store(#[from] OrderStoreError),

    /// The `OrderCreated` event could not be encoded.
    #[error("Failed to encode event: {0}")]
    Event(#[from] EventError),

    /// The order was stored but its event was not published.
    ///
    /// Call [`OrderIntake::publish_created`] to retry the announcement.
    #[error("Order {order_id} stored but not published: {source}")]
    Publish {
        /// The stored order
        order_id: OrderId,
        /// Bus failure
        source: EventBusError,
    },
}

/// Accepts orders: insert first, publish second.
pub struct OrderIntake<S> {
    store: S,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    topic: String,
}

impl<S: OrderStore> OrderIntake<S> {
    /// Create an intake publishing to the `order-created` topic.
    #[must_use]
    pub fn new(store: S, bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            bus,
            clock,
            topic: ORDER_CREATED_TOPIC.to_string(),
        }
    }

    /// Publish to `topic` instead.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Store `order` without a route plan and publish exactly one
    /// `OrderCreated` event for it.
    ///
    /// `created_at` is overwritten with the intake clock's time.
    ///
    /// # Errors
    ///
    /// - [`IntakeError::Store`] if the insert fails (nothing is published)
    /// - [`IntakeError::Publish`] if the insert succeeded but publishing failed
    pub async fn create_order(&self, mut order: NewOrder) -> Result<Order, IntakeError> {
        order.created_at = self.clock.now();
        let order = self.store.insert(order).await?;
        tracing::info!(order_id = %order.id, customer = %order.customer_name, "Order stored");

        self.publish_created(order.id).await?;
        OrderMetrics::record_created();
        Ok(order)
    }

    /// Publish `OrderCreated` for an order that is already stored.
    ///
    /// # Errors
    ///
    /// - [`IntakeError::Event`] if the event cannot be encoded
    /// - [`IntakeError::Publish`] if the bus rejects it
    pub async fn publish_created(&self, order_id: OrderId) -> Result<(), IntakeError> {
        let event = SerializedEvent::from_event(&OrderEvent::OrderCreated { order_id }, None)?;

        self.bus
            .publish(&self.topic, &event)
            .await
            .map_err(|source| {
                tracing::error!(%order_id, error = %source, "Failed to publish OrderCreated");
                IntakeError::Publish { order_id, source }
            })?;

        tracing::info!(%order_id, topic = %self.topic, "OrderCreated published");
        Ok(())
    }
}
