use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    LedgerError, NewProduct, Order, OrderId, OrderItem, OrderLine, Product, ProductId, ProductStock,
    Reservation, Result, UserId, Warehouse, WarehouseId, WarehouseStatus, WarehouseStock,
};

/// Core trait for stock record store implementations.
///
/// Reads outside a transaction are snapshots for display and polling only.
/// Any read that feeds a stock mutation must go through [`LedgerTx`].
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Opens a new atomic unit. Dropping the returned transaction without
    /// calling [`LedgerTx::commit`] rolls back every write made through it.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>>;

    /// Reservation rows held by an order, ordered by (product, warehouse).
    async fn get_reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>>;

    async fn get_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<WarehouseStock>>;

    /// All stock rows of a product, ordered by warehouse id.
    async fn list_stock(&self, product_id: ProductId) -> Result<Vec<WarehouseStock>>;

    async fn get_warehouse(&self, warehouse_id: WarehouseId) -> Result<Option<Warehouse>>;

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>>;

    /// Distinct orders holding at least one reservation with
    /// `expires_at < now`, oldest deadline first.
    async fn expired_orders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>>;

    async fn insert_product(&self, product: NewProduct) -> Result<Product>;

    async fn insert_warehouse(&self, name: &str, active: bool) -> Result<Warehouse>;

    /// Toggles a warehouse's active flag.
    ///
    /// Fails with `WarehouseNotFound` if the warehouse doesn't exist.
    async fn set_warehouse_active(&self, warehouse_id: WarehouseId, active: bool) -> Result<()>;

    /// Sets the physical quantity of a stock row, creating it if absent.
    /// The reserved counter is preserved and the invariant is checked.
    async fn put_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<WarehouseStock>;

    /// Creates a pending order with one item per line, priced from the
    /// product table, in a single atomic unit.
    async fn create_order(&self, user_id: UserId, lines: &[OrderLine]) -> Result<Order>;
}

/// An open atomic unit against the store.
///
/// Methods named `lock_*` take an exclusive row lock that is held until the
/// transaction ends. Callers must acquire locks in ascending
/// (product id, warehouse id) order to stay deadlock-free.
#[async_trait]
pub trait LedgerTx: Send {
    /// Locks and reads an order header.
    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<Order>>;

    async fn mark_order_paid(&mut self, order_id: OrderId) -> Result<()>;

    /// Reads a warehouse under a shared lock, so its active flag cannot
    /// change before commit.
    async fn lock_warehouse(&mut self, warehouse_id: WarehouseId) -> Result<Option<Warehouse>>;

    /// Locks and reads every stock row of a product held by an active
    /// warehouse, in ascending warehouse id order.
    async fn lock_active_stock(&mut self, product_id: ProductId) -> Result<Vec<WarehouseStock>>;

    async fn lock_stock(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<WarehouseStock>>;

    /// Inserts a zeroed stock row unless one exists.
    async fn ensure_stock(&mut self, warehouse_id: WarehouseId, product_id: ProductId)
    -> Result<()>;

    /// Writes both counters of a previously locked row. Rejects rows that
    /// break the invariant.
    async fn write_stock(&mut self, stock: &WarehouseStock) -> Result<()>;

    /// Locks and reads an order's reservations, ordered by (product, warehouse).
    async fn lock_reservations(&mut self, order_id: OrderId) -> Result<Vec<Reservation>>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()>;

    /// Deletes every reservation of an order, returning the number removed.
    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Extension trait providing convenience methods for stock stores.
#[async_trait]
pub trait StockStoreExt: StockStore {
    /// Totals for a product across every warehouse.
    async fn product_stock(&self, product_id: ProductId) -> Result<ProductStock> {
        let rows = self.list_stock(product_id).await?;
        Ok(ProductStock::from_rows(product_id, &rows))
    }

    /// Available units at one warehouse, zero when no row exists.
    async fn available_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<i64> {
        Ok(self
            .get_stock(warehouse_id, product_id)
            .await?
            .map(|row| row.available())
            .unwrap_or(0))
    }

    /// Applies an administrative status change to a warehouse.
    async fn set_warehouse_status(
        &self,
        warehouse_id: WarehouseId,
        status: WarehouseStatus,
    ) -> Result<()> {
        self.set_warehouse_active(warehouse_id, status.is_active())
            .await
    }

    /// Returns true if the warehouse exists and is active.
    async fn warehouse_is_active(&self, warehouse_id: WarehouseId) -> Result<bool> {
        Ok(self
            .get_warehouse(warehouse_id)
            .await?
            .is_some_and(|w| w.active))
    }
}

// Blanket implementation for all StockStore implementations
impl<T: StockStore + ?Sized> StockStoreExt for T {}

/// Validates order lines before an order is created.
pub fn validate_order_lines(lines: &[OrderLine]) -> Result<()> {
    if lines.is_empty() {
        return Err(LedgerError::InvalidOrder(
            "order must contain at least one line".to_string(),
        ));
    }
    if let Some(line) = lines.iter().find(|line| line.quantity <= 0) {
        return Err(LedgerError::InvalidOrder(format!(
            "quantity for product {} must be positive, got {}",
            line.product_id, line.quantity
        )));
    }
    Ok(())
}
