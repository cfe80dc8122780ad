//! Read path for orders and their route plans.

use routeminds_core::cache::Cache;
use routeminds_core::order_store::{OrderStore, OrderStoreError};
use routeminds_core::{Order, OrderId, RoutePlan, route_cache_key};
use thiserror::Error;

/// Errors from the read path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    /// Record store failure.
    #[error("Order store error: {0}")]
    Store(#[from] OrderStoreError),

    /// A stored or cached route plan is not valid JSON for a plan.
    #[error("Corrupt route plan for order {order_id}: {reason}")]
    CorruptRoutePlan {
        /// Order whose plan failed to parse
        order_id: OrderId,
        /// Parser message
        reason: String,
    },
}

/// Where an order's route plan stands.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteStatus {
    /// The plan has been computed.
    Ready(RoutePlan),
    /// The order exists but has not been processed yet.
    Pending,
    /// No such order.
    NotFound,
}

/// Looks up orders and route plans.
///
/// Route plans are served from the cache when present and from the order
/// record otherwise. An expired or unreachable cache never turns a processed
/// order back into a pending one.
pub struct RouteQuery<S, C> {
    store: S,
    cache: C,
}

impl<S: OrderStore, C: Cache> RouteQuery<S, C> {
    /// Create a query over `store` and `cache`.
    #[must_use]
    pub const fn new(store: S, cache: C) -> Self {
        Self { store, cache }
    }

    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the store fails.
    pub async fn order(&self, id: OrderId) -> Result<Option<Order>, QueryError> {
        Ok(self.store.get(id).await?)
    }

    /// Every order, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Store`] if the store fails.
    pub async fn orders(&self) -> Result<Vec<Order>, QueryError> {
        Ok(self.store.list().await?)
    }

    /// Route plan status for `id`.
    ///
    /// # Errors
    ///
    /// - [`QueryError::Store`] if the store fails on a cache miss
    /// - [`QueryError::CorruptRoutePlan`] if the stored payload does not parse
    pub async fn route_status(&self, id: OrderId) -> Result<RouteStatus, QueryError> {
        let key = route_cache_key(id);

        match self.cache.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<RoutePlan>(&bytes) {
                Ok(plan) => return Ok(RouteStatus::Ready(plan)),
                Err(error) => {
                    tracing::warn!(order_id = %id, error = %error, "Ignoring unparseable cached route plan");
                }
            },
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(order_id = %id, error = %error, "Cache read failed, falling back to order store");
            }
        }

        let Some(order) = self.store.get(id).await? else {
            return Ok(RouteStatus::NotFound);
        };

        match order.route_plan() {
            Ok(Some(plan)) => Ok(RouteStatus::Ready(plan)),
            Ok(None) => Ok(RouteStatus::Pending),
            Err(error) => Err(QueryError::CorruptRoutePlan {
                order_id: id,
                reason: error.to_string(),
            }),
        }
    }
}
