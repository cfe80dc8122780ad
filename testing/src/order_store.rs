use routeminds_core::order_store::{Commit, OrderStore, OrderStoreError, Result};
use routeminds_core::{NewOrder, Order, OrderId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// In-memory order store for fast, deterministic testing.
///
/// Identities are assigned sequentially from 1. `commit` is write-once for the
/// route plan payload, like the Postgres store's conditional update.
///
/// Clones share the same records.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOrderStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    orders: RwLock<BTreeMap<OrderId, Order>>,
    last_id: AtomicI64,
    failing_commits: AtomicU32,
    commits_applied: AtomicU32,
}

impl InMemoryOrderStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `commit` fail with a database error.
    pub fn fail_next_commits(&self, n: u32) {
        self.inner.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Number of commits that actually wrote a payload.
    #[must_use]
    pub fn commits_applied(&self) -> u32 {
        self.inner.commits_applied.load(Ordering::SeqCst)
    }

    /// Snapshot of a record without going through the async trait.
    #[must_use]
    pub fn snapshot(&self, id: OrderId) -> Option<Order> {
        self.inner
            .orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Number of stored orders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl OrderStore for InMemoryOrderStore {
    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.snapshot(id))
    }

    async fn list(&self) -> Result<Vec<Order>> {
        Ok(self
            .inner
            .orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    async fn insert(&self, order: NewOrder) -> Result<Order> {
        let id = OrderId::new(self.inner.last_id.fetch_add(1, Ordering::SeqCst) + 1);
        let order = Order::from_new(id, order);
        self.inner
            .orders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, order.clone());
        Ok(order)
    }

    async fn commit(&self, order: &Order) -> Result<Commit> {
        if self.take_injected_failure() {
            return Err(OrderStoreError::DatabaseError(
                "injected commit failure".to_string(),
            ));
        }

        let mut orders = self
            .inner
            .orders
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = orders
            .get_mut(&order.id)
            .ok_or(OrderStoreError::NotFound(order.id))?;

        if stored.is_processed() {
            return Ok(Commit::AlreadyCommitted(stored.clone()));
        }

        stored.route_plan_json.clone_from(&order.route_plan_json);
        self.inner.commits_applied.fetch_add(1, Ordering::SeqCst);
        Ok(Commit::Applied)
    }
}
