//! Order record types.
//!
//! An [`Order`] is created by intake with no route plan and receives exactly one
//! route plan payload from the order processor. The payload is kept in its
//! serialized form so the durable record and the cache carry byte-identical
//! documents.

use crate::route_plan::RoutePlan;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque order identity, assigned by the record store at insert time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(i64);

impl OrderId {
    /// Wrap a raw identity value.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw identity value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for OrderId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// An order that has not been persisted yet.
///
/// Intake builds one of these from the accepted request; the store assigns
/// the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    /// Customer name as entered.
    pub customer_name: String,
    /// Free-form delivery address.
    pub delivery_address: String,
    /// Pickup latitude in degrees.
    pub latitude: f64,
    /// Pickup longitude in degrees.
    pub longitude: f64,
    /// Package weight in kilograms.
    pub package_weight_kg: Decimal,
    /// When the order was accepted.
    pub created_at: DateTime<Utc>,
}

/// A persisted order record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Store-assigned identity, immutable.
    pub id: OrderId,
    /// Customer name as entered.
    pub customer_name: String,
    /// Free-form delivery address.
    pub delivery_address: String,
    /// Pickup latitude in degrees.
    pub latitude: f64,
    /// Pickup longitude in degrees.
    pub longitude: f64,
    /// Package weight in kilograms.
    pub package_weight_kg: Decimal,
    /// When the order was accepted.
    pub created_at: DateTime<Utc>,
    /// Serialized [`RoutePlan`], absent until the order has been processed.
    pub route_plan_json: Option<String>,
}

impl Order {
    /// Build the stored record for a new order with the identity the store assigned.
    #[must_use]
    pub fn from_new(id: OrderId, new: NewOrder) -> Self {
        Self {
            id,
            customer_name: new.customer_name,
            delivery_address: new.delivery_address,
            latitude: new.latitude,
            longitude: new.longitude,
            package_weight_kg: new.package_weight_kg,
            created_at: new.created_at,
            route_plan_json: None,
        }
    }

    /// Whether a route plan has already been written for this order.
    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.route_plan_json
            .as_deref()
            .is_some_and(|payload| !payload.is_empty())
    }

    /// Decode the stored route plan payload, if any.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the stored payload is not a valid route plan.
    pub fn route_plan(&self) -> Result<Option<RoutePlan>, serde_json::Error> {
        match self.route_plan_json.as_deref() {
            Some(payload) if !payload.is_empty() => RoutePlan::from_json(payload).map(Some),
            _ => Ok(None),
        }
    }
}
