//! `PostgreSQL` adapters for the RouteMinds pipeline.
//!
//! - [`PostgresOrderStore`]: the durable order record store, with write-once
//!   route plan commits
//! - [`PostgresDeadLetterQueue`]: persistent dead-letter destination with
//!   operator workflows (list, resolve, discard)
//!
//! Both share the migrations in `migrations/`, applied by
//! [`PostgresOrderStore::migrate`].
//!
//! # Example
//!
//! ```ignore
//! use routeminds_postgres::{PostgresDeadLetterQueue, PostgresOrderStore};
//!
//! let store = PostgresOrderStore::connect(&database_url, 10).await?;
//! store.migrate().await?;
//! let dead_letters = PostgresDeadLetterQueue::new(store.pool().clone());
//! ```

#![forbid(unsafe_code)]

mod dead_letter_queue;
mod order_store;

pub use dead_letter_queue::{DLQStatus, FailedEvent, PostgresDeadLetterQueue};
pub use order_store::PostgresOrderStore;
