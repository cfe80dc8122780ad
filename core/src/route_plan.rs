//! Route plan document.
//!
//! The JSON shape of [`RoutePlan`] is the contract read by everything polling the
//! cache:
//!
//! ```json
//! {
//!   "orderId": 10,
//!   "origin": "Berlin Hub",
//!   "destination": "Alexanderplatz 1, Berlin",
//!   "estimatedDistanceKm": 0.0,
//!   "processedAt": "2025-01-01T00:00:00Z"
//! }
//! ```

use crate::order::OrderId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a cached route plan stays readable after it is written.
pub const ROUTE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Cache key under which the route plan for `order_id` is stored.
///
/// Writer and readers must agree on this exactly.
///
/// ```
/// use routeminds_core::{OrderId, route_cache_key};
///
/// assert_eq!(route_cache_key(OrderId::new(10)), "route_10");
/// ```
#[must_use]
pub fn route_cache_key(order_id: OrderId) -> String {
    format!("route_{order_id}")
}

/// The computed delivery plan for one order. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlan {
    /// The order this plan belongs to.
    pub order_id: OrderId,
    /// Name of the assigned hub.
    pub origin: String,
    /// Delivery address copied from the order.
    pub destination: String,
    /// Hub-to-pickup distance in kilometers, rounded to two decimals.
    pub estimated_distance_km: f64,
    /// When the plan was computed.
    pub processed_at: DateTime<Utc>,
}

impl RoutePlan {
    /// Serialize to the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if serialization fails. A non-finite
    /// distance does not fail here: it is written as `null`, which
    /// [`from_json`](Self::from_json) rejects. Callers check the distance first.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if `payload` is not a route plan document.
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn plan() -> RoutePlan {
        RoutePlan {
            order_id: OrderId::new(10),
            origin: "Munich Hub".to_string(),
            destination: "Marienplatz 8, München".to_string(),
            estimated_distance_km: 12.35,
            processed_at: DateTime::parse_from_rfc3339("2025-01-01T12:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn wire_form_uses_camel_case_fields() {
        let json: serde_json::Value = serde_json::from_str(&plan().to_json().unwrap()).unwrap();

        assert_eq!(json["orderId"], 10);
        assert_eq!(json["origin"], "Munich Hub");
        assert_eq!(json["destination"], "Marienplatz 8, München");
        assert_eq!(json["estimatedDistanceKm"], 12.35);
        assert_eq!(json["processedAt"], "2025-01-01T12:30:00Z");
    }

    #[test]
    fn json_roundtrip_preserves_every_field() {
        let original = plan();
        let decoded = RoutePlan::from_json(&original.to_json().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn non_finite_distance_does_not_read_back() {
        let mut infinite = plan();
        infinite.estimated_distance_km = f64::INFINITY;

        let payload = infinite.to_json().unwrap();
        assert!(payload.contains("\"estimatedDistanceKm\":null"));
        assert!(RoutePlan::from_json(&payload).is_err());
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(route_cache_key(OrderId::new(0)), "route_0");
        assert_eq!(route_cache_key(OrderId::new(123_456)), "route_123456");
    }
}
