//! Durable order record storage.
//!
//! The store is shared by intake and every consumer worker without any locking in
//! the callers. Two guarantees make that safe:
//!
//! - a reader observes a record either without a route plan payload or with a
//!   complete one, never a partial write;
//! - [`OrderStore::commit`] is write-once for the payload: once a record carries
//!   a route plan, later commits leave it untouched and report the stored record.

use crate::order::{NewOrder, Order, OrderId};
use std::future::Future;
use thiserror::Error;

/// Errors from order store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderStoreError {
    /// Backend failure (connection, query, constraint).
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The record to commit does not exist.
    #[error("Order {0} not found")]
    NotFound(OrderId),

    /// A stored row could not be mapped to an order.
    #[error("Corrupt order record: {0}")]
    Corrupt(String),
}

/// Result type for order store operations.
pub type Result<T> = std::result::Result<T, OrderStoreError>;

/// Outcome of committing a route plan payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    /// The payload was written by this commit.
    Applied,
    /// Another writer got there first; this is the record as stored.
    AlreadyCommitted(Order),
}

/// Keyed storage for order records.
///
/// # Example
///
/// ```ignore
/// let order = store.insert(new_order).await?;
/// let loaded = store.get(order.id).await?;
/// assert_eq!(loaded, Some(order));
/// ```
pub trait OrderStore: Send + Sync {
    /// Point lookup by identity.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the lookup fails.
    fn get(&self, id: OrderId) -> impl Future<Output = Result<Option<Order>>> + Send;

    /// Every stored order, in identity order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the scan fails.
    fn list(&self) -> impl Future<Output = Result<Vec<Order>>> + Send;

    /// Insert a new order and return it with its assigned identity.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the insert fails.
    fn insert(&self, order: NewOrder) -> impl Future<Output = Result<Order>> + Send;

    /// Persist the route plan payload of `order` atomically.
    ///
    /// Only the payload is mutable; other fields of `order` are ignored. The write
    /// is applied only if the stored record has no payload yet.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::NotFound`] if the record does not exist and
    /// [`OrderStoreError::DatabaseError`] if the update fails.
    fn commit(&self, order: &Order) -> impl Future<Output = Result<Commit>> + Send;
}
