//! Hub table and nearest-hub assignment.
//!
//! Distances are flat Euclidean distances in raw degrees, scaled by
//! [`KM_PER_DEGREE`]. This is not a geodesic distance; existing consumers of
//! the route plan depend on these exact numbers, so the formula must not be
//! "corrected".
//!
//! # Example
//!
//! ```
//! use routeminds_core::hub::{HubTable, assign_hub};
//!
//! let hubs = HubTable::reference();
//! let assignment = assign_hub(&hubs, 52.52, 13.405);
//! assert_eq!(assignment.hub.name, "Berlin Hub");
//! assert_eq!(assignment.distance_km, 0.0);
//! ```

use crate::order::Order;
use crate::route_plan::RoutePlan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Degrees-to-kilometers factor (one degree of latitude at the equator).
pub const KM_PER_DEGREE: f64 = 111.0;

/// Errors building a hub table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubTableError {
    /// A hub table must contain at least one hub.
    #[error("Hub table must not be empty")]
    Empty,
}

/// A fixed dispatch location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hub {
    /// Display name, copied into route plans as the origin.
    pub name: String,
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl Hub {
    /// Create a hub.
    #[must_use]
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            name: name.into(),
            latitude,
            longitude,
        }
    }
}

/// Non-empty, ordered, immutable set of hubs.
///
/// Table order matters: when two hubs are equally near, the earlier one wins.
#[derive(Debug, Clone, PartialEq)]
pub struct HubTable {
    first: Hub,
    rest: Vec<Hub>,
}

impl HubTable {
    /// Build a table from an ordered list of hubs.
    ///
    /// # Errors
    ///
    /// Returns [`HubTableError::Empty`] if `hubs` is empty.
    pub fn new(hubs: Vec<Hub>) -> Result<Self, HubTableError> {
        let mut hubs = hubs.into_iter();
        let first = hubs.next().ok_or(HubTableError::Empty)?;
        Ok(Self {
            first,
            rest: hubs.collect(),
        })
    }

    /// The three hubs of the reference deployment.
    #[must_use]
    pub fn reference() -> Self {
        Self {
            first: Hub::new("Berlin Hub", 52.5200, 13.4050),
            rest: vec![
                Hub::new("Hamburg Hub", 53.5511, 9.9937),
                Hub::new("Munich Hub", 48.1351, 11.5820),
            ],
        }
    }

    /// Hubs in table order.
    pub fn hubs(&self) -> impl Iterator<Item = &Hub> {
        std::iter::once(&self.first).chain(&self.rest)
    }

    /// Number of hubs in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        1 + self.rest.len()
    }

    /// Always `false`; a table cannot be constructed empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

impl Default for HubTable {
    fn default() -> Self {
        Self::reference()
    }
}

/// Result of assigning a point to its nearest hub.
#[derive(Debug, Clone, PartialEq)]
pub struct HubAssignment<'a> {
    /// The nearest hub.
    pub hub: &'a Hub,
    /// Distance in kilometers, rounded to two decimals.
    pub distance_km: f64,
}

/// Euclidean distance between two points, in degrees.
#[must_use]
pub fn euclidean_degrees(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = lat1 - lat2;
    let d_lon = lon1 - lon2;
    (d_lat * d_lat + d_lon * d_lon).sqrt()
}

/// Round a kilometer value to two decimals, ties to even.
///
/// ```
/// use routeminds_core::hub::round_km;
///
/// assert_eq!(round_km(0.125), 0.12);
/// assert_eq!(round_km(0.375), 0.38);
/// ```
#[must_use]
pub fn round_km(km: f64) -> f64 {
    (km * 100.0).round_ties_even() / 100.0
}

/// Find the hub nearest to `(latitude, longitude)`.
///
/// Ties resolve to the first equally distant hub in table order. Never fails:
/// the table is non-empty by construction.
#[must_use]
pub fn assign_hub(hubs: &HubTable, latitude: f64, longitude: f64) -> HubAssignment<'_> {
    let first = &hubs.first;
    let mut nearest = first;
    let mut nearest_distance = euclidean_degrees(latitude, longitude, first.latitude, first.longitude);

    for hub in &hubs.rest {
        let distance = euclidean_degrees(latitude, longitude, hub.latitude, hub.longitude);
        // Strict comparison keeps the earlier hub on ties.
        if distance < nearest_distance {
            nearest = hub;
            nearest_distance = distance;
        }
    }

    HubAssignment {
        hub: nearest,
        distance_km: round_km(nearest_distance * KM_PER_DEGREE),
    }
}

/// Compute the route plan for `order` against `hubs`, stamped with `processed_at`.
#[must_use]
pub fn assign_route(hubs: &HubTable, order: &Order, processed_at: DateTime<Utc>) -> RoutePlan {
    let assignment = assign_hub(hubs, order.latitude, order.longitude);

    RoutePlan {
        order_id: order.id,
        origin: assignment.hub.name.clone(),
        destination: order.delivery_address.clone(),
        estimated_distance_km: assignment.distance_km,
        processed_at,
    }
}
