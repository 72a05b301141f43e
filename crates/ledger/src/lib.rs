//! Record store for per-warehouse stock, orders and reservations.
//!
//! The store is deliberately thin: it exposes row-locking reads and plain
//! writes inside a [`LedgerTx`], and leaves every decision to the caller.
//! Two implementations are provided, an in-memory store for tests and a
//! PostgreSQL store for production.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use common::{OrderId, ProductId, UserId, WarehouseId};
pub use error::{LedgerError, Result};
pub use memory::InMemoryStockStore;
pub use model::{
    NewProduct, Order, OrderItem, OrderLine, OrderStatus, Product, ProductStock, Reservation,
    Warehouse, WarehouseStatus, WarehouseStock,
};
pub use postgres::PostgresStockStore;
pub use store::{LedgerTx, StockStore, StockStoreExt, validate_order_lines};
