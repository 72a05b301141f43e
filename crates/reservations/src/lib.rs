//! Multi-warehouse stock reservation engine.
//!
//! Coordinators for the four stock operations:
//! - [`ReservationCoordinator`] holds stock for a pending order
//! - [`SettlementCoordinator`] converts held stock into a sale
//! - [`TransferCoordinator`] moves unreserved stock between warehouses
//! - [`ExpiryWatcher`] returns held stock once its deadline passes
//!
//! Every stock change goes through a [`StockLedger`], which locks rows in
//! ascending (product, warehouse) order and checks
//! `0 <= reserved <= quantity` before each write.

pub mod backoff;
pub mod config;
mod deadline;
pub mod error;
pub mod expiry;
pub mod notify;
pub mod reservation;
pub mod settlement;
pub mod stock_ledger;
pub mod transfer;

pub use backoff::Backoff;
pub use config::{DEFAULT_RESERVATION_TTL, ReservationConfig, WatcherConfig};
pub use error::{ErrorKind, InventoryError, Result};
pub use expiry::{ExpiryWatcher, ReleaseReceipt, ReleaseTrigger, SweepReport};
pub use notify::{
    ExpiryFeed, ExpiryStream, InMemoryNotifier, NotifyError, RedisNotifier, ReservationNotifier,
    parse_reservation_key, reservation_key,
};
pub use reservation::{CheckoutReceipt, ReservationCoordinator, ReservationReceipt, first_fit};
pub use settlement::{SettlementCoordinator, SettlementReceipt};
pub use stock_ledger::{LockedStock, StockLedger};
pub use transfer::{TransferCoordinator, TransferReceipt, TransferRequest};
