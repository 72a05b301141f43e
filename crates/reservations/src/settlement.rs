//! Settlement of reserved orders.

use std::time::Instant;

use chrono::Utc;
use ledger::{OrderId, OrderStatus, Reservation, StockStore, UserId};
use serde::Serialize;

use crate::config::ReservationConfig;
use crate::deadline::within_deadline;
use crate::error::{InventoryError, Result};
use crate::stock_ledger::StockLedger;

/// Outcome of a successful settlement.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReceipt {
    pub order_id: OrderId,
    pub status: OrderStatus,
    /// The reservations converted into sales.
    pub settled: Vec<Reservation>,
}

/// Converts an order's live reservations into a sale.
pub struct SettlementCoordinator<S: StockStore> {
    store: S,
    config: ReservationConfig,
}

impl<S: StockStore> SettlementCoordinator<S> {
    pub fn new(store: S, config: ReservationConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Settles a pending order on behalf of its owner.
    ///
    /// Checks run in order: the order exists, belongs to `user_id`, is
    /// pending, and holds reservations none of which has expired. Each
    /// reserved unit then leaves both `quantity` and `reserved`, the rows are
    /// deleted and the order is marked paid, all in one atomic unit.
    #[tracing::instrument(skip(self))]
    pub async fn settle(&self, order_id: OrderId, user_id: UserId) -> Result<SettlementReceipt> {
        let started = Instant::now();
        let result = within_deadline(
            self.config.request_timeout,
            self.settle_atomically(order_id, user_id),
        )
        .await;
        metrics::histogram!("settlement_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match &result {
            Ok(receipt) => {
                metrics::counter!("settlements_total", "outcome" => "paid").increment(1);
                tracing::info!(rows = receipt.settled.len(), "order settled");
            }
            Err(err) => {
                metrics::counter!("settlements_total", "outcome" => err.kind().as_str())
                    .increment(1);
                tracing::warn!(error = %err, "settlement rejected");
            }
        }
        result
    }

    async fn settle_atomically(
        &self,
        order_id: OrderId,
        user_id: UserId,
    ) -> Result<SettlementReceipt> {
        let mut ledger = StockLedger::begin(&self.store).await?;

        let order = ledger
            .lock_order(order_id)
            .await?
            .ok_or_else(|| InventoryError::order_not_found(order_id))?;
        if order.user_id != user_id {
            return Err(InventoryError::Ownership { order_id, user_id });
        }
        if order.status != OrderStatus::Pending {
            return Err(InventoryError::InvalidState {
                order_id,
                reason: format!("order is {}", order.status),
            });
        }

        let reservations = ledger.lock_reservations(order_id).await?;
        let now = Utc::now();
        if reservations.is_empty() || reservations.iter().any(|r| r.is_expired(now)) {
            return Err(InventoryError::InvalidState {
                order_id,
                reason: "reservation expired".to_string(),
            });
        }

        for reservation in &reservations {
            let stock = ledger
                .lock_stock(reservation.warehouse_id, reservation.product_id)
                .await?
                .ok_or(InventoryError::StockNotFound {
                    warehouse_id: reservation.warehouse_id,
                    product_id: reservation.product_id,
                })?;
            ledger.consume(stock, reservation.quantity).await?;
        }
        ledger.delete_reservations(order_id).await?;
        ledger.mark_order_paid(order_id).await?;
        ledger.commit().await?;

        Ok(SettlementReceipt {
            order_id,
            status: OrderStatus::Paid,
            settled: reservations,
        })
    }
}
