use thiserror::Error;

use crate::{OrderId, ProductId, WarehouseId};

/// Errors that can occur when interacting with the stock record store.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A write would leave a stock row outside `0 <= reserved <= quantity`.
    #[error(
        "Stock invariant violated for warehouse {warehouse_id} product {product_id}: quantity={quantity}, reserved={reserved}"
    )]
    InvariantViolation {
        warehouse_id: WarehouseId,
        product_id: ProductId,
        quantity: i64,
        reserved: i64,
    },

    /// The referenced product does not exist.
    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    /// The referenced warehouse does not exist.
    #[error("Warehouse not found: {0}")]
    WarehouseNotFound(WarehouseId),

    /// The referenced order does not exist.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The lines submitted for a new order are malformed.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// A stored value could not be decoded into its record type.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    /// Returns true for failures of the underlying store itself rather than
    /// of the data it holds. Lock timeouts and deadlocks fall in this group.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Migration(_))
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
