//! Invariant-enforcing access to stock rows inside one atomic unit.
//!
//! Every stock mutation goes through [`StockLedger`]. Mutations accept only a
//! [`LockedStock`], which can only be obtained from one of the ledger's
//! `lock_*` methods, so a decision can never be made on an unlocked read.
//! Each mutation re-checks `0 <= reserved <= quantity` before writing.

use ledger::{
    LedgerTx, Order, OrderId, ProductId, Reservation, StockStore, Warehouse, WarehouseId,
    WarehouseStock,
};

use crate::error::{InventoryError, Result};

/// A stock row read under an exclusive lock held by the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockedStock(WarehouseStock);

impl LockedStock {
    pub fn row(&self) -> &WarehouseStock {
        &self.0
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.0.warehouse_id
    }

    pub fn available(&self) -> i64 {
        self.0.available()
    }
}

/// Adds `quantity` to the reserved counter.
pub fn apply_reserve(row: WarehouseStock, quantity: i64) -> ledger::Result<WarehouseStock> {
    let next = WarehouseStock {
        reserved: row.reserved.saturating_add(quantity),
        ..row
    };
    next.check_invariant()?;
    Ok(next)
}

/// Removes sold units: both counters drop by `quantity`.
pub fn apply_consume(row: WarehouseStock, quantity: i64) -> ledger::Result<WarehouseStock> {
    let next = WarehouseStock {
        quantity: row.quantity.saturating_sub(quantity),
        reserved: row.reserved.saturating_sub(quantity),
        ..row
    };
    next.check_invariant()?;
    Ok(next)
}

/// Returns reserved units to the available pool, clamping at zero.
pub fn apply_unreserve(row: WarehouseStock, quantity: i64) -> ledger::Result<WarehouseStock> {
    let next = WarehouseStock {
        reserved: row.reserved.saturating_sub(quantity).max(0),
        ..row
    };
    next.check_invariant()?;
    Ok(next)
}

/// Moves physical units between two rows; reserved counters are untouched.
pub fn apply_move(
    source: WarehouseStock,
    destination: WarehouseStock,
    quantity: i64,
) -> ledger::Result<(WarehouseStock, WarehouseStock)> {
    let source = WarehouseStock {
        quantity: source.quantity.saturating_sub(quantity),
        ..source
    };
    let destination = WarehouseStock {
        quantity: destination.quantity.saturating_add(quantity),
        ..destination
    };
    source.check_invariant()?;
    destination.check_invariant()?;
    Ok((source, destination))
}

/// An open atomic unit with the stock locking discipline applied.
///
/// Dropping the ledger without calling [`StockLedger::commit`] rolls back.
pub struct StockLedger {
    tx: Box<dyn LedgerTx>,
}

impl StockLedger {
    pub async fn begin<S: StockStore + ?Sized>(store: &S) -> Result<Self> {
        Ok(Self {
            tx: store.begin().await?,
        })
    }

    pub async fn lock_order(&mut self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.tx.lock_order(order_id).await?)
    }

    pub async fn mark_order_paid(&mut self, order_id: OrderId) -> Result<()> {
        Ok(self.tx.mark_order_paid(order_id).await?)
    }

    pub async fn lock_warehouse(&mut self, warehouse_id: WarehouseId) -> Result<Option<Warehouse>> {
        Ok(self.tx.lock_warehouse(warehouse_id).await?)
    }

    /// Locks every active-warehouse row of a product, ascending by warehouse.
    pub async fn lock_candidates(&mut self, product_id: ProductId) -> Result<Vec<LockedStock>> {
        let rows = self.tx.lock_active_stock(product_id).await?;
        Ok(rows.into_iter().map(LockedStock).collect())
    }

    pub async fn lock_stock(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<Option<LockedStock>> {
        Ok(self
            .tx
            .lock_stock(warehouse_id, product_id)
            .await?
            .map(LockedStock))
    }

    /// Locks two rows of the same product in ascending warehouse order,
    /// whatever their logical roles, and returns them as `(first, second)`.
    pub async fn lock_pair(
        &mut self,
        product_id: ProductId,
        first: WarehouseId,
        second: WarehouseId,
    ) -> Result<(Option<LockedStock>, Option<LockedStock>)> {
        if first <= second {
            let a = self.lock_stock(first, product_id).await?;
            let b = self.lock_stock(second, product_id).await?;
            Ok((a, b))
        } else {
            let b = self.lock_stock(second, product_id).await?;
            let a = self.lock_stock(first, product_id).await?;
            Ok((a, b))
        }
    }

    pub async fn ensure_stock(
        &mut self,
        warehouse_id: WarehouseId,
        product_id: ProductId,
    ) -> Result<()> {
        Ok(self.tx.ensure_stock(warehouse_id, product_id).await?)
    }

    pub async fn lock_reservations(&mut self, order_id: OrderId) -> Result<Vec<Reservation>> {
        Ok(self.tx.lock_reservations(order_id).await?)
    }

    pub async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        Ok(self.tx.insert_reservation(reservation).await?)
    }

    pub async fn delete_reservations(&mut self, order_id: OrderId) -> Result<u64> {
        Ok(self.tx.delete_reservations(order_id).await?)
    }

    pub async fn reserve(&mut self, stock: LockedStock, quantity: i64) -> Result<WarehouseStock> {
        let next = apply_reserve(stock.0, quantity)?;
        self.tx.write_stock(&next).await?;
        Ok(next)
    }

    pub async fn consume(&mut self, stock: LockedStock, quantity: i64) -> Result<WarehouseStock> {
        let next = apply_consume(stock.0, quantity)?;
        self.tx.write_stock(&next).await?;
        Ok(next)
    }

    pub async fn unreserve(
        &mut self,
        stock: LockedStock,
        quantity: i64,
    ) -> Result<WarehouseStock> {
        let next = apply_unreserve(stock.0, quantity)?;
        self.tx.write_stock(&next).await?;
        Ok(next)
    }

    pub async fn move_quantity(
        &mut self,
        source: LockedStock,
        destination: LockedStock,
        quantity: i64,
    ) -> Result<(WarehouseStock, WarehouseStock)> {
        if source.0.lock_key() == destination.0.lock_key() {
            return Err(InventoryError::Validation(
                "source and destination must be different rows".to_string(),
            ));
        }
        let (source, destination) = apply_move(source.0, destination.0, quantity)?;
        self.tx.write_stock(&source).await?;
        self.tx.write_stock(&destination).await?;
        Ok((source, destination))
    }

    pub async fn commit(self) -> Result<()> {
        Ok(self.tx.commit().await?)
    }
}
