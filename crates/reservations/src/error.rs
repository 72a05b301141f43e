//! Error taxonomy for the reservation engine.

use std::time::Duration;

use ledger::{LedgerError, OrderId, ProductId, UserId, WarehouseId};
use thiserror::Error;

use crate::notify::NotifyError;

/// Coarse classification used by callers to decide how to surface an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or out-of-range input. Never retried.
    Validation,
    /// A referenced order, product, warehouse or stock row is absent.
    NotFound,
    /// The request conflicts with current state. The caller may retry after
    /// resolving the conflict.
    Conflict,
    /// The store or notification channel is unavailable.
    Transient,
}

impl ErrorKind {
    /// Label used for outcome metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
        }
    }
}

/// Errors that can occur during reservation engine operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("No stock row for product {product_id} at warehouse {warehouse_id}")]
    StockNotFound {
        warehouse_id: WarehouseId,
        product_id: ProductId,
    },

    /// No eligible warehouse (reserve) or not enough headroom at the source
    /// warehouse (transfer).
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    #[error("Order {order_id} does not belong to user {user_id}")]
    Ownership { order_id: OrderId, user_id: UserId },

    #[error("Order {order_id} is in an invalid state: {reason}")]
    InvalidState { order_id: OrderId, reason: String },

    #[error("Warehouse {0} is not active")]
    WarehouseInactive(WarehouseId),

    #[error("Order {0} already holds reservations")]
    AlreadyReserved(OrderId),

    #[error("Operation exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Stock ledger error: {0}")]
    Ledger(LedgerError),

    #[error("Notification channel error: {0}")]
    Notify(#[from] NotifyError),
}

impl InventoryError {
    pub(crate) fn order_not_found(order_id: OrderId) -> Self {
        Self::NotFound {
            entity: "order",
            id: order_id.as_i64(),
        }
    }

    pub(crate) fn warehouse_not_found(warehouse_id: WarehouseId) -> Self {
        Self::NotFound {
            entity: "warehouse",
            id: warehouse_id.as_i64(),
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } | Self::StockNotFound { .. } => ErrorKind::NotFound,
            Self::InsufficientStock { .. }
            | Self::Ownership { .. }
            | Self::InvalidState { .. }
            | Self::WarehouseInactive(_)
            | Self::AlreadyReserved(_) => ErrorKind::Conflict,
            Self::Ledger(err) if !err.is_transient() => ErrorKind::Conflict,
            Self::Ledger(_) | Self::Notify(_) | Self::DeadlineExceeded(_) => {
                ErrorKind::Transient
            }
        }
    }
}

impl From<LedgerError> for InventoryError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::ProductNotFound(id) => Self::NotFound {
                entity: "product",
                id: id.as_i64(),
            },
            LedgerError::WarehouseNotFound(id) => Self::warehouse_not_found(id),
            LedgerError::OrderNotFound(id) => Self::order_not_found(id),
            LedgerError::InvalidOrder(reason) => Self::Validation(reason),
            other => Self::Ledger(other),
        }
    }
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, InventoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_not_found_maps_to_not_found_kind() {
        let err: InventoryError = LedgerError::ProductNotFound(ProductId::new(4)).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "product not found: 4");
    }

    #[test]
    fn invalid_order_maps_to_validation() {
        let err: InventoryError = LedgerError::InvalidOrder("empty".to_string()).into();
        assert!(matches!(err, InventoryError::Validation(_)));
    }

    #[test]
    fn invariant_violation_is_a_conflict() {
        let err: InventoryError = LedgerError::InvariantViolation {
            warehouse_id: WarehouseId::new(1),
            product_id: ProductId::new(1),
            quantity: 1,
            reserved: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn deadline_and_channel_errors_are_transient() {
        assert_eq!(
            InventoryError::DeadlineExceeded(Duration::from_secs(1)).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            InventoryError::Notify(NotifyError::Disconnected).kind(),
            ErrorKind::Transient
        );
    }
}
