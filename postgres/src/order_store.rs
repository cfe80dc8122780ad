//! `PostgreSQL` order store.

use chrono::{DateTime, Utc};
use routeminds_core::order_store::{Commit, OrderStore, OrderStoreError, Result};
use routeminds_core::{NewOrder, Order, OrderId};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

const SELECT_ORDER: &str = r"
    SELECT id, customer_name, delivery_address, latitude, longitude,
           package_weight_kg, created_at, route_plan_json
    FROM orders
";

/// Order records in the `orders` table.
///
/// `commit` is a conditional update that only writes the route plan while the
/// stored one is still absent, so concurrent duplicate deliveries cannot
/// replace a committed plan.
///
/// # Example
///
/// ```no_run
/// use routeminds_postgres::PostgresOrderStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresOrderStore::connect("postgres://localhost/routeminds", 10).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// The underlying pool, for sharing with the dead-letter queue.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the bundled migrations (`orders` and `failed_events`).
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    async fn fetch(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("{SELECT_ORDER} WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to load order: {e}")))?;

        row.as_ref().map(row_to_order).transpose()
    }
}

fn row_to_order(row: &PgRow) -> Result<Order> {
    let corrupt = |e: sqlx::Error| OrderStoreError::Corrupt(e.to_string());

    Ok(Order {
        id: OrderId::new(row.try_get("id").map_err(corrupt)?),
        customer_name: row.try_get("customer_name").map_err(corrupt)?,
        delivery_address: row.try_get("delivery_address").map_err(corrupt)?,
        latitude: row.try_get("latitude").map_err(corrupt)?,
        longitude: row.try_get("longitude").map_err(corrupt)?,
        package_weight_kg: row.try_get::<Decimal, _>("package_weight_kg").map_err(corrupt)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(corrupt)?,
        route_plan_json: row.try_get("route_plan_json").map_err(corrupt)?,
    })
}

impl OrderStore for PostgresOrderStore {
    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        self.fetch(id).await
    }

    async fn list(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(&format!("{SELECT_ORDER} ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to list orders: {e}")))?;

        rows.iter().map(row_to_order).collect()
    }

    async fn insert(&self, order: NewOrder) -> Result<Order> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO orders (
                customer_name, delivery_address, latitude, longitude,
                package_weight_kg, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(&order.customer_name)
        .bind(&order.delivery_address)
        .bind(order.latitude)
        .bind(order.longitude)
        .bind(order.package_weight_kg)
        .bind(order.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to insert order: {e}")))?;

        let order = Order::from_new(OrderId::new(id), order);
        tracing::debug!(order_id = %order.id, "Order inserted");
        metrics::counter!("order_store.inserted").increment(1);
        Ok(order)
    }

    async fn commit(&self, order: &Order) -> Result<Commit> {
        let result = sqlx::query(
            r"
            UPDATE orders
            SET route_plan_json = $2
            WHERE id = $1
              AND (route_plan_json IS NULL OR route_plan_json = '')
            ",
        )
        .bind(order.id.get())
        .bind(order.route_plan_json.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| OrderStoreError::DatabaseError(format!("Failed to commit order: {e}")))?;

        if result.rows_affected() == 1 {
            metrics::counter!("order_store.committed").increment(1);
            return Ok(Commit::Applied);
        }

        // Either the row is gone or another writer committed first.
        match self.fetch(order.id).await? {
            Some(stored) => {
                tracing::debug!(order_id = %order.id, "Route plan already committed");
                metrics::counter!("order_store.commit_conflicts").increment(1);
                Ok(Commit::AlreadyCommitted(stored))
            }
            None => Err(OrderStoreError::NotFound(order.id)),
        }
    }
}
