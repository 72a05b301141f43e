//! Reservation of stock for pending orders.

use std::time::Instant;

use chrono::{DateTime, Utc};
use ledger::{
    Order, OrderId, OrderLine, OrderStatus, Reservation, StockStore, UserId,
    validate_order_lines,
};
use serde::Serialize;

use crate::config::ReservationConfig;
use crate::deadline::within_deadline;
use crate::error::{InventoryError, Result};
use crate::notify::ReservationNotifier;
use crate::stock_ledger::{LockedStock, StockLedger};

/// Outcome of a successful reservation.
#[derive(Debug, Clone, Serialize)]
pub struct ReservationReceipt {
    pub order_id: OrderId,
    pub expires_at: DateTime<Utc>,
    /// One row per order line, in ascending product order.
    pub reservations: Vec<Reservation>,
    /// False when the expiry signal could not be armed. The sweep still
    /// releases the reservation once it expires.
    pub notification_armed: bool,
}

/// Outcome of [`ReservationCoordinator::checkout`].
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutReceipt {
    pub order: Order,
    pub reservation: ReservationReceipt,
}

/// Picks the lowest-id candidate whose available stock covers `quantity`.
pub fn first_fit(candidates: &[LockedStock], quantity: i64) -> Option<LockedStock> {
    candidates
        .iter()
        .filter(|candidate| candidate.available() >= quantity)
        .min_by_key(|candidate| candidate.warehouse_id())
        .copied()
}

/// Reserves stock for orders, all-or-nothing.
pub struct ReservationCoordinator<S, N>
where
    S: StockStore,
    N: ReservationNotifier,
{
    store: S,
    notifier: N,
    config: ReservationConfig,
}

impl<S, N> ReservationCoordinator<S, N>
where
    S: StockStore,
    N: ReservationNotifier,
{
    pub fn new(store: S, notifier: N, config: ReservationConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Reserves every line of a pending order.
    ///
    /// Each line is served whole by the lowest-id active warehouse with
    /// enough available stock. Either every line is reserved or nothing is.
    /// The expiry signal is armed only after commit, and a failure to arm
    /// is logged rather than returned.
    #[tracing::instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn reserve(
        &self,
        order_id: OrderId,
        lines: &[OrderLine],
    ) -> Result<ReservationReceipt> {
        let started = Instant::now();
        let result = match validate_order_lines(lines) {
            Ok(()) => {
                within_deadline(
                    self.config.request_timeout,
                    self.reserve_atomically(order_id, lines),
                )
                .await
            }
            Err(err) => Err(err.into()),
        };
        metrics::histogram!("reservation_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let (reservations, expires_at) = match result {
            Ok(committed) => {
                metrics::counter!("reservations_total", "outcome" => "reserved").increment(1);
                committed
            }
            Err(err) => {
                metrics::counter!("reservations_total", "outcome" => err.kind().as_str())
                    .increment(1);
                tracing::warn!(error = %err, "reservation rejected");
                return Err(err);
            }
        };

        let notification_armed = match self.notifier.arm(order_id, self.config.ttl).await {
            Ok(()) => true,
            Err(err) => {
                metrics::counter!("reservation_notifications_failed_total").increment(1);
                tracing::warn!(
                    error = %err,
                    "failed to arm expiry signal, reservation will be released by the sweep"
                );
                false
            }
        };

        tracing::info!(%expires_at, rows = reservations.len(), "order reserved");
        Ok(ReservationReceipt {
            order_id,
            expires_at,
            reservations,
            notification_armed,
        })
    }

    async fn reserve_atomically(
        &self,
        order_id: OrderId,
        lines: &[OrderLine],
    ) -> Result<(Vec<Reservation>, DateTime<Utc>)> {
        let mut ledger = StockLedger::begin(&self.store).await?;

        let order = ledger
            .lock_order(order_id)
            .await?
            .ok_or_else(|| InventoryError::order_not_found(order_id))?;
        if order.status != OrderStatus::Pending {
            return Err(InventoryError::InvalidState {
                order_id,
                reason: format!("order is {}", order.status),
            });
        }
        if !ledger.lock_reservations(order_id).await?.is_empty() {
            return Err(InventoryError::AlreadyReserved(order_id));
        }

        let ttl = chrono::Duration::from_std(self.config.ttl)
            .map_err(|_| InventoryError::Validation("reservation ttl out of range".to_string()))?;
        let expires_at = Utc::now() + ttl;

        // Rows are locked in ascending product order across all lines.
        let mut ordered = lines.to_vec();
        ordered.sort_by_key(|line| line.product_id);

        let mut reservations = Vec::with_capacity(ordered.len());
        for line in &ordered {
            let candidates = ledger.lock_candidates(line.product_id).await?;
            let Some(chosen) = first_fit(&candidates, line.quantity) else {
                let available = candidates
                    .iter()
                    .map(LockedStock::available)
                    .max()
                    .unwrap_or(0);
                return Err(InventoryError::InsufficientStock {
                    product_id: line.product_id,
                    requested: line.quantity,
                    available,
                });
            };

            let row = ledger.reserve(chosen, line.quantity).await?;
            let reservation = Reservation {
                order_id,
                product_id: line.product_id,
                warehouse_id: row.warehouse_id,
                quantity: line.quantity,
                expires_at,
            };
            ledger.insert_reservation(&reservation).await?;
            tracing::debug!(
                product_id = %line.product_id,
                warehouse_id = %row.warehouse_id,
                quantity = line.quantity,
                "line reserved"
            );
            reservations.push(reservation);
        }

        ledger.commit().await?;
        Ok((reservations, expires_at))
    }

    /// Creates a pending order for the user and reserves its lines.
    ///
    /// If the reservation fails the order stays pending with no
    /// reservations, and may be reserved again later.
    #[tracing::instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn checkout(&self, user_id: UserId, lines: &[OrderLine]) -> Result<CheckoutReceipt> {
        let order = self.store.create_order(user_id, lines).await?;
        tracing::info!(order_id = %order.id, total = order.total_amount, "order created");
        let reservation = self.reserve(order.id, lines).await?;
        Ok(CheckoutReceipt { order, reservation })
    }
}
