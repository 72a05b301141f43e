use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    LedgerError, NewProduct, Order, OrderId, OrderItem, OrderLine, OrderStatus, Product,
    ProductId, Reservation, Result, UserId, Warehouse, WarehouseId, WarehouseStock,
    store::{LedgerTx, StockStore, validate_order_lines},
};

const STOCK_INVARIANT_CONSTRAINT: &str = "warehouse_stock_reserved_within_quantity";

/// PostgreSQL-backed stock store implementation.
///
/// Row locks are taken with `SELECT ... FOR UPDATE`; a transaction that is
/// dropped before commit is rolled back by sqlx.
#[derive(Clone)]
pub struct PostgresStockStore {
    pool: PgPool,
}

impl PostgresStockStore {
    /// Creates a new PostgreSQL stock store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn row_to_order(row: PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: OrderId::new(row.try_get("id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        total_amount: row.try_get("total_amount")?,
        status: OrderStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_stock(row: PgRow) -> Result<WarehouseStock> {
    Ok(WarehouseStock {
        warehouse_id: WarehouseId::new(row.try_get("warehouse_id")?),
        product_id: ProductId::new(row.try_get("product_id")?),
        quantity: row.try_get("quantity")?,
        reserved: row.try_get("reserved")?,
    })
}

fn row_to_reservation(row: PgRow) -> Result<Reservation> {
    Ok(Reservation {
        order_id: OrderId::new(row.try_get("order_id")?),
        product_id: ProductId::new(row.try_get("product_id")?),
        warehouse_id: WarehouseId::new(row.try_get("warehouse_id")?),
        quantity: row.try_get("quantity")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn row_to_warehouse(row: PgRow) -> Result<Warehouse> {
    Ok(Warehouse {
        id: WarehouseId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        active: row.try_get("active")?,
    })
}

fn row_to_product(row: PgRow) -> Result<Product> {
    Ok(Product {
        id: ProductId::new(row.try_get("id")?),
        name: row.try_get("name")?,
        price_cents: row.try_get("price_cents")?,
        description: row.try_get("description")?,
    })
}

fn violates(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

#[async_trait]
impl StockStore for PostgresStockStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            "SELECT id, user_id, total_amount, status, created_at FROM orders WHERE id = $1",
        )
        .bind(order_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_order).transpose()
    }

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, quantity, price
            FROM order_items
            WHERE order_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(order_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(OrderItem {
                    order_id: OrderId::new(row.try_get("order_id")?),
                    product_id: ProductId::new(row.try_get("product_id")?),
                    quantity: row.try_get("quantity")?,
                    unit_price: row.try_get("price")?,
                })
            })
            .collect()
    }

    async fn get_reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, warehouse_id, quantity, expires_at
            FROM reservations
            WHERE order_id = $1
            ORDER BY product_id ASC, warehouse_id ASC
            "#,
        )
        .bind(order_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_reservation).collect()
    }

    async fn get_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<WarehouseStock>> {
        let row = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, quantity, reserved
            FROM warehouse_stock
            WHERE warehouse_id = $1 AND product_id = $2
            "#,
        )
        .bind(warehouse_id.as_i64())
        .bind(product_id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_stock).transpose()
    }

    async fn list_stock(&self, product_id: ProductId) -> Result<Vec<WarehouseStock>> {
        let rows = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, quantity, reserved
            FROM warehouse_stock
            WHERE product_id = $1
            ORDER BY warehouse_id ASC
            "#,
        )
        .bind(product_id.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_stock).collect()
    }

    async fn get_warehouse(&self, warehouse_id: WarehouseId) -> Result<Option<Warehouse>> {
        let row = sqlx::query("SELECT id, name, active FROM warehouses WHERE id = $1")
            .bind(warehouse_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_warehouse).transpose()
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>> {
        let row =
            sqlx::query("SELECT id, name, price_cents, description FROM products WHERE id = $1")
                .bind(product_id.as_i64())
                .fetch_optional(&self.pool)
                .await?;

        row.map(row_to_product).transpose()
    }

    async fn expired_orders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT order_id
            FROM reservations
            WHERE expires_at < $1
            GROUP BY order_id
            ORDER BY MIN(expires_at) ASC, order_id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(OrderId::new).collect())
    }

    async fn insert_product(&self, product: NewProduct) -> Result<Product> {
        let row = sqlx::query(
            r#"
            INSERT INTO products (name, price_cents, description)
            VALUES ($1, $2, $3)
            RETURNING id, name, price_cents, description
            "#,
        )
        .bind(&product.name)
        .bind(product.price_cents)
        .bind(&product.description)
        .fetch_one(&self.pool)
        .await?;

        row_to_product(row)
    }

    async fn insert_warehouse(&self, name: &str, active: bool) -> Result<Warehouse> {
        let row = sqlx::query(
            "INSERT INTO warehouses (name, active) VALUES ($1, $2) RETURNING id, name, active",
        )
        .bind(name)
        .bind(active)
        .fetch_one(&self.pool)
        .await?;

        row_to_warehouse(row)
    }

    async fn set_warehouse_active(&self, warehouse_id: WarehouseId, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE warehouses SET active = $1 WHERE id = $2")
            .bind(active)
            .bind(warehouse_id.as_i64())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::WarehouseNotFound(warehouse_id));
        }
        Ok(())
    }

    async fn put_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<WarehouseStock> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, quantity, reserved
            FROM warehouse_stock
            WHERE warehouse_id = $1 AND product_id = $2
            FOR UPDATE
            "#,
        )
        .bind(warehouse_id.as_i64())
        .bind(product_id.as_i64())
        .fetch_optional(&mut *tx)
        .await?
        .map(row_to_stock)
        .transpose()?;

        let row = match existing {
            Some(mut row) => {
                row.quantity = quantity;
                row.check_invariant()?;
                sqlx::query(
                    r#"
                    UPDATE warehouse_stock
                    SET quantity = $1, updated_at = NOW()
                    WHERE warehouse_id = $2 AND product_id = $3
                    "#,
                )
                .bind(quantity)
                .bind(warehouse_id.as_i64())
                .bind(product_id.as_i64())
                .execute(&mut *tx)
                .await?;
                row
            }
            None => {
                let row = WarehouseStock {
                    quantity,
                    ..WarehouseStock::empty(warehouse_id, product_id)
                };
                row.check_invariant()?;
                sqlx::query(
                    r#"
                    INSERT INTO warehouse_stock (warehouse_id, product_id, quantity, reserved)
                    VALUES ($1, $2, $3, 0)
                    "#,
                )
                .bind(warehouse_id.as_i64())
                .bind(product_id.as_i64())
                .bind(quantity)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if violates(&e, "warehouse_stock_warehouse_id_fkey") {
                        return LedgerError::WarehouseNotFound(warehouse_id);
                    }
                    if violates(&e, "warehouse_stock_product_id_fkey") {
                        return LedgerError::ProductNotFound(product_id);
                    }
                    LedgerError::Database(e)
                })?;
                row
            }
        };

        tx.commit().await?;
        Ok(row)
    }

    async fn create_order(&self, user_id: UserId, lines: &[OrderLine]) -> Result<Order> {
        validate_order_lines(lines)?;
        let mut tx = self.pool.begin().await?;

        let mut prices = Vec::with_capacity(lines.len());
        for line in lines {
            let price: Option<i64> =
                sqlx::query_scalar("SELECT price_cents FROM products WHERE id = $1")
                    .bind(line.product_id.as_i64())
                    .fetch_optional(&mut *tx)
                    .await?;
            prices.push(price.ok_or(LedgerError::ProductNotFound(line.product_id))?);
        }

        let total_amount: i64 = lines
            .iter()
            .zip(&prices)
            .map(|(line, price)| line.quantity * price)
            .sum();

        let row = sqlx::query(
            r#"
            INSERT INTO orders (user_id, total_amount, status)
            VALUES ($1, $2, 'pending')
            RETURNING id, user_id, total_amount, status, created_at
            "#,
        )
        .bind(user_id.as_i64())
        .bind(total_amount)
        .fetch_one(&mut *tx)
        .await?;
        let order = row_to_order(row)?;

        for (line, price) in lines.iter().zip(prices) {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, product_id, quantity, price)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(order.id.as_i64())
            .bind(line.product_id.as_i64())
            .bind(line.quantity)
            .bind(price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(order)
    }
}

/// Transaction over the PostgreSQL store.
struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, total_amount, status, created_at
            FROM orders
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(order_id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(row_to_order).transpose()
    }

    async fn mark_order_paid(&mut self, order_id: OrderId) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = 'paid' WHERE id = $1")
            .bind(order_id.as_i64())
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::OrderNotFound(order_id));
        }
        Ok(())
    }

    async fn lock_warehouse(&mut self, warehouse_id: WarehouseId) -> Result<Option<Warehouse>> {
        let row = sqlx::query("SELECT id, name, active FROM warehouses WHERE id = $1 FOR SHARE")
            .bind(warehouse_id.as_i64())
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(row_to_warehouse).transpose()
    }

    async fn lock_active_stock(&mut self, product_id: ProductId) -> Result<Vec<WarehouseStock>> {
        let rows = sqlx::query(
            r#"
            SELECT ws.warehouse_id, ws.product_id, ws.quantity, ws.reserved
            FROM warehouse_stock ws
            JOIN warehouses w ON w.id = ws.warehouse_id
            WHERE ws.product_id = $1 AND w.active = TRUE
            ORDER BY ws.warehouse_id ASC
            FOR UPDATE OF ws
            "#,
        )
        .bind(product_id.as_i64())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(row_to_stock).collect()
    }

    async fn lock_stock(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<WarehouseStock>> {
        let row = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, quantity, reserved
            FROM warehouse_stock
            WHERE warehouse_id = $1 AND product_id = $2
            FOR UPDATE
            "#,
        )
        .bind(warehouse_id.as_i64())
        .bind(product_id.as_i64())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(row_to_stock).transpose()
    }

    async fn ensure_stock(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO warehouse_stock (warehouse_id, product_id, quantity, reserved)
            VALUES ($1, $2, 0, 0)
            ON CONFLICT (warehouse_id, product_id) DO NOTHING
            "#,
        )
        .bind(warehouse_id.as_i64())
        .bind(product_id.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if violates(&e, "warehouse_stock_warehouse_id_fkey") {
                return LedgerError::WarehouseNotFound(warehouse_id);
            }
            if violates(&e, "warehouse_stock_product_id_fkey") {
                return LedgerError::ProductNotFound(product_id);
            }
            LedgerError::Database(e)
        })?;
        Ok(())
    }

    async fn write_stock(&mut self, stock: &WarehouseStock) -> Result<()> {
        stock.check_invariant()?;

        let result = sqlx::query(
            r#"
            UPDATE warehouse_stock
            SET quantity = $1, reserved = $2, updated_at = NOW()
            WHERE warehouse_id = $3 AND product_id = $4
            "#,
        )
        .bind(stock.quantity)
        .bind(stock.reserved)
        .bind(stock.warehouse_id.as_i64())
        .bind(stock.product_id.as_i64())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if violates(&e, STOCK_INVARIANT_CONSTRAINT) {
                return LedgerError::InvariantViolation {
                    warehouse_id: stock.warehouse_id,
                    product_id: stock.product_id,
                    quantity: stock.quantity,
                    reserved: stock.reserved,
                };
            }
            LedgerError::Database(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::CorruptRecord(format!(
                "no stock row for warehouse {} product {}",
                stock.warehouse_id, stock.product_id
            )));
        }
        Ok(())
    }

    async fn lock_reservations(&mut self, order_id: OrderId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, product_id, warehouse_id, quantity, expires_at
            FROM reservations
            WHERE order_id = $1
            ORDER BY product_id ASC, warehouse_id ASC
            FOR UPDATE
            "#,
        )
        .bind(order_id.as_i64())
        .fetch_all(&mut *self.tx)
        .await?;

        rows.into_iter().map(row_to_reservation).collect()
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (order_id, product_id, warehouse_id, quantity, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(reservation.order_id.as_i64())
        .bind(reservation.product_id.as_i64())
        .bind(reservation.warehouse_id.as_i64())
        .bind(reservation.quantity)
        .bind(reservation.expires_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM reservations WHERE order_id = $1")
            .bind(order_id.as_i64())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
