use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    LedgerError, NewProduct, Order, OrderId, OrderItem, OrderLine, OrderStatus, Product,
    ProductId, Reservation, Result, UserId, Warehouse, WarehouseId, WarehouseStock,
    store::{LedgerTx, StockStore, validate_order_lines},
};

#[derive(Debug, Clone, Default)]
struct Tables {
    products: BTreeMap<ProductId, Product>,
    warehouses: BTreeMap<WarehouseId, Warehouse>,
    orders: BTreeMap<OrderId, Order>,
    order_items: Vec<OrderItem>,
    // Keyed (warehouse, product) so iteration walks warehouses in ascending order.
    stock: BTreeMap<(WarehouseId, ProductId), WarehouseStock>,
    reservations: Vec<Reservation>,
    last_product_id: i64,
    last_warehouse_id: i64,
    last_order_id: i64,
}

fn next_id(last: &mut i64) -> i64 {
    *last += 1;
    *last
}

impl Tables {
    fn reservations_for(&self, order_id: OrderId) -> Vec<Reservation> {
        let mut rows: Vec<_> = self
            .reservations
            .iter()
            .filter(|r| r.order_id == order_id)
            .copied()
            .collect();
        rows.sort_by_key(|r| r.lock_key());
        rows
    }
}

/// In-memory stock store implementation for testing.
///
/// A transaction holds the whole store exclusively for its lifetime and
/// works on a private copy that replaces the shared state on commit. This is
/// coarser than row locking but gives the same guarantees: no interleaved
/// read-decide-write, and no partial effects after a rollback.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStockStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stock row, ordered by (warehouse, product).
    pub async fn all_stock(&self) -> Vec<WarehouseStock> {
        self.tables.lock().await.stock.values().copied().collect()
    }

    /// Returns the total number of reservation rows.
    pub async fn reservation_count(&self) -> usize {
        self.tables.lock().await.reservations.len()
    }
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let committed = Arc::clone(&self.tables).lock_owned().await;
        let working = (*committed).clone();
        Ok(Box::new(InMemoryTx { committed, working }))
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.tables.lock().await.orders.get(&order_id).cloned())
    }

    async fn get_order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .order_items
            .iter()
            .filter(|item| item.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn get_reservations(&self, order_id: OrderId) -> Result<Vec<Reservation>> {
        Ok(self.tables.lock().await.reservations_for(order_id))
    }

    async fn get_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<WarehouseStock>> {
        let tables = self.tables.lock().await;
        Ok(tables.stock.get(&(warehouse_id, product_id)).copied())
    }

    async fn list_stock(&self, product_id: ProductId) -> Result<Vec<WarehouseStock>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .stock
            .values()
            .filter(|row| row.product_id == product_id)
            .copied()
            .collect())
    }

    async fn get_warehouse(&self, warehouse_id: WarehouseId) -> Result<Option<Warehouse>> {
        Ok(self
            .tables
            .lock()
            .await
            .warehouses
            .get(&warehouse_id)
            .cloned())
    }

    async fn get_product(&self, product_id: ProductId) -> Result<Option<Product>> {
        Ok(self.tables.lock().await.products.get(&product_id).cloned())
    }

    async fn expired_orders(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>> {
        let tables = self.tables.lock().await;

        let mut earliest: HashMap<OrderId, DateTime<Utc>> = HashMap::new();
        for r in tables.reservations.iter().filter(|r| r.expires_at < now) {
            earliest
                .entry(r.order_id)
                .and_modify(|at| *at = (*at).min(r.expires_at))
                .or_insert(r.expires_at);
        }

        let mut orders: Vec<_> = earliest.into_iter().collect();
        orders.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        Ok(orders.into_iter().take(limit).map(|(id, _)| id).collect())
    }

    async fn insert_product(&self, product: NewProduct) -> Result<Product> {
        let mut tables = self.tables.lock().await;
        let id = ProductId::new(next_id(&mut tables.last_product_id));
        let product = Product {
            id,
            name: product.name,
            price_cents: product.price_cents,
            description: product.description,
        };
        tables.products.insert(id, product.clone());
        Ok(product)
    }

    async fn insert_warehouse(&self, name: &str, active: bool) -> Result<Warehouse> {
        let mut tables = self.tables.lock().await;
        let id = WarehouseId::new(next_id(&mut tables.last_warehouse_id));
        let warehouse = Warehouse {
            id,
            name: name.to_string(),
            active,
        };
        tables.warehouses.insert(id, warehouse.clone());
        Ok(warehouse)
    }

    async fn set_warehouse_active(&self, warehouse_id: WarehouseId, active: bool) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let warehouse = tables
            .warehouses
            .get_mut(&warehouse_id)
            .ok_or(LedgerError::WarehouseNotFound(warehouse_id))?;
        warehouse.active = active;
        Ok(())
    }

    async fn put_stock(
        &self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<WarehouseStock> {
        let mut tables = self.tables.lock().await;
        if !tables.warehouses.contains_key(&warehouse_id) {
            return Err(LedgerError::WarehouseNotFound(warehouse_id));
        }
        if !tables.products.contains_key(&product_id) {
            return Err(LedgerError::ProductNotFound(product_id));
        }

        let mut row = tables
            .stock
            .get(&(warehouse_id, product_id))
            .copied()
            .unwrap_or(WarehouseStock::empty(warehouse_id, product_id));
        row.quantity = quantity;
        row.check_invariant()?;

        tables.stock.insert((warehouse_id, product_id), row);
        Ok(row)
    }

    async fn create_order(&self, user_id: UserId, lines: &[OrderLine]) -> Result<Order> {
        validate_order_lines(lines)?;
        let mut tables = self.tables.lock().await;

        let mut items = Vec::with_capacity(lines.len());
        let mut total_amount = 0;
        for line in lines {
            let product = tables
                .products
                .get(&line.product_id)
                .ok_or(LedgerError::ProductNotFound(line.product_id))?;
            total_amount += product.price_cents * line.quantity;
            items.push((line.product_id, line.quantity, product.price_cents));
        }

        let order = Order {
            id: OrderId::new(next_id(&mut tables.last_order_id)),
            user_id,
            total_amount,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
        };
        tables.orders.insert(order.id, order.clone());
        tables
            .order_items
            .extend(items.into_iter().map(|(product_id, quantity, unit_price)| {
                OrderItem {
                    order_id: order.id,
                    product_id,
                    quantity,
                    unit_price,
                }
            }));

        Ok(order)
    }
}

/// Transaction over the in-memory store.
struct InMemoryTx {
    committed: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl LedgerTx for InMemoryTx {
    async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.working.orders.get(&order_id).cloned())
    }

    async fn mark_order_paid(&mut self, order_id: OrderId) -> Result<()> {
        let order = self
            .working
            .orders
            .get_mut(&order_id)
            .ok_or(LedgerError::OrderNotFound(order_id))?;
        order.status = OrderStatus::Paid;
        Ok(())
    }

    async fn lock_warehouse(&mut self, warehouse_id: WarehouseId) -> Result<Option<Warehouse>> {
        Ok(self.working.warehouses.get(&warehouse_id).cloned())
    }

    async fn lock_active_stock(&mut self, product_id: ProductId) -> Result<Vec<WarehouseStock>> {
        let tables = &self.working;
        Ok(tables
            .stock
            .values()
            .filter(|row| row.product_id == product_id)
            .filter(|row| {
                tables
                    .warehouses
                    .get(&row.warehouse_id)
                    .is_some_and(|w| w.active)
            })
            .copied()
            .collect())
    }

    async fn lock_stock(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<WarehouseStock>> {
        Ok(self.working.stock.get(&(warehouse_id, product_id)).copied())
    }

    async fn ensure_stock(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<()> {
        if !self.working.warehouses.contains_key(&warehouse_id) {
            return Err(LedgerError::WarehouseNotFound(warehouse_id));
        }
        if !self.working.products.contains_key(&product_id) {
            return Err(LedgerError::ProductNotFound(product_id));
        }
        self.working
            .stock
            .entry((warehouse_id, product_id))
            .or_insert(WarehouseStock::empty(warehouse_id, product_id));
        Ok(())
    }

    async fn write_stock(&mut self, stock: &WarehouseStock) -> Result<()> {
        stock.check_invariant()?;
        let row = self
            .working
            .stock
            .get_mut(&(stock.warehouse_id, stock.product_id))
            .ok_or_else(|| {
                LedgerError::CorruptRecord(format!(
                    "no stock row for warehouse {} product {}",
                    stock.warehouse_id, stock.product_id
                ))
            })?;
        *row = *stock;
        Ok(())
    }

    async fn lock_reservations(&mut self, order_id: OrderId) -> Result<Vec<Reservation>> {
        Ok(self.working.reservations_for(order_id))
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        self.working.reservations.push(*reservation);
        Ok(())
    }

    async fn delete_reservations(&mut self, order_id: OrderId) -> Result<u64> {
        let before = self.working.reservations.len();
        self.working
            .reservations
            .retain(|r| r.order_id != order_id);
        Ok((before - self.working.reservations.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTx {
            mut committed,
            working,
        } = *self;
        *committed = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{StockStoreExt, WarehouseStatus};

    async fn seeded() -> (InMemoryStockStore, WarehouseId, ProductId) {
        let store = InMemoryStockStore::new();
        let warehouse = store.insert_warehouse("Main", true).await.unwrap();
        let product = store
            .insert_product(NewProduct::new("Widget", 1_500))
            .await
            .unwrap();
        store.put_stock(warehouse.id, product.id, 10).await.unwrap();
        (store, warehouse.id, product.id)
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let (store, warehouse_id, product_id) = seeded().await;

        {
            let mut tx = store.begin().await.unwrap();
            let mut row = tx.lock_stock(warehouse_id, product_id).await.unwrap().unwrap();
            row.reserved = 4;
            tx.write_stock(&row).await.unwrap();
        }

        let row = store.get_stock(warehouse_id, product_id).await.unwrap().unwrap();
        assert_eq!(row.reserved, 0);
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let (store, warehouse_id, product_id) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let mut row = tx.lock_stock(warehouse_id, product_id).await.unwrap().unwrap();
        row.reserved = 4;
        tx.write_stock(&row).await.unwrap();
        tx.commit().await.unwrap();

        let row = store.get_stock(warehouse_id, product_id).await.unwrap().unwrap();
        assert_eq!(row.reserved, 4);
        assert_eq!(row.available(), 6);
    }

    #[tokio::test]
    async fn write_stock_rejects_invariant_violation() {
        let (store, warehouse_id, product_id) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let mut row = tx.lock_stock(warehouse_id, product_id).await.unwrap().unwrap();
        row.reserved = 11;
        let result = tx.write_stock(&row).await;
        assert!(matches!(
            result,
            Err(LedgerError::InvariantViolation { reserved: 11, .. })
        ));
    }

    #[tokio::test]
    async fn create_order_prices_lines_from_catalog() {
        let (store, _, product_id) = seeded().await;
        let other = store
            .insert_product(NewProduct::new("Gadget", 250))
            .await
            .unwrap();

        let order = store
            .create_order(
                UserId::new(7),
                &[OrderLine::new(product_id, 2), OrderLine::new(other.id, 3)],
            )
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total_amount, 2 * 1_500 + 3 * 250);
        let items = store.get_order_items(order.id).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].unit_price, 250);
    }

    #[tokio::test]
    async fn create_order_rejects_unknown_product_without_writing() {
        let (store, _, product_id) = seeded().await;
        let missing = ProductId::new(999);

        let result = store
            .create_order(
                UserId::new(1),
                &[OrderLine::new(product_id, 1), OrderLine::new(missing, 1)],
            )
            .await;
        assert!(result.is_err());
        assert!(store.get_order(OrderId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_stock_preserves_reserved_and_checks_invariant() {
        let (store, warehouse_id, product_id) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        let mut row = tx.lock_stock(warehouse_id, product_id).await.unwrap().unwrap();
        row.reserved = 6;
        tx.write_stock(&row).await.unwrap();
        tx.commit().await.unwrap();

        let row = store.put_stock(warehouse_id, product_id, 20).await.unwrap();
        assert_eq!(row.reserved, 6);
        assert!(store.put_stock(warehouse_id, product_id, 5).await.is_err());
    }

    #[tokio::test]
    async fn lock_active_stock_skips_inactive_warehouses() {
        let (store, first, product_id) = seeded().await;
        let second = store.insert_warehouse("Overflow", true).await.unwrap();
        store.put_stock(second.id, product_id, 3).await.unwrap();
        store.set_warehouse_active(first, false).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let rows = tx.lock_active_stock(product_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].warehouse_id, second.id);
    }

    #[tokio::test]
    async fn set_warehouse_active_unknown_warehouse() {
        let store = InMemoryStockStore::new();
        let result = store.set_warehouse_active(WarehouseId::new(5), true).await;
        assert!(matches!(result, Err(LedgerError::WarehouseNotFound(_))));
    }

    #[tokio::test]
    async fn warehouse_status_from_admin_input() {
        let (store, warehouse_id, _) = seeded().await;

        let status: WarehouseStatus = "deactive".parse().unwrap();
        store.set_warehouse_status(warehouse_id, status).await.unwrap();
        assert!(!store.warehouse_is_active(warehouse_id).await.unwrap());

        let status: WarehouseStatus = "active".parse().unwrap();
        store.set_warehouse_status(warehouse_id, status).await.unwrap();
        assert!(store.warehouse_is_active(warehouse_id).await.unwrap());
    }

    #[tokio::test]
    async fn expired_orders_returns_oldest_deadline_first() {
        let (store, warehouse_id, product_id) = seeded().await;
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        for (order, offset) in [(1, -10), (2, -30), (3, 60)] {
            tx.insert_reservation(&Reservation {
                order_id: OrderId::new(order),
                product_id,
                warehouse_id,
                quantity: 1,
                expires_at: now + Duration::seconds(offset),
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();

        let expired = store.expired_orders(now, 10).await.unwrap();
        assert_eq!(expired, vec![OrderId::new(2), OrderId::new(1)]);

        let limited = store.expired_orders(now, 1).await.unwrap();
        assert_eq!(limited, vec![OrderId::new(2)]);
    }

    #[tokio::test]
    async fn delete_reservations_counts_rows() {
        let (store, warehouse_id, product_id) = seeded().await;

        let mut tx = store.begin().await.unwrap();
        for _ in 0..2 {
            tx.insert_reservation(&Reservation {
                order_id: OrderId::new(1),
                product_id,
                warehouse_id,
                quantity: 1,
                expires_at: Utc::now(),
            })
            .await
            .unwrap();
        }
        assert_eq!(tx.delete_reservations(OrderId::new(1)).await.unwrap(), 2);
        assert_eq!(tx.delete_reservations(OrderId::new(1)).await.unwrap(), 0);
    }
}
