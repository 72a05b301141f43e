//! Movement of physical stock between warehouses.

use ledger::{ProductId, StockStore, WarehouseId, WarehouseStock};
use serde::{Deserialize, Serialize};

use crate::config::ReservationConfig;
use crate::deadline::within_deadline;
use crate::error::{InventoryError, Result};
use crate::stock_ledger::StockLedger;

/// A request to move units of one product between two warehouses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub product_id: ProductId,
    pub from_warehouse: WarehouseId,
    pub to_warehouse: WarehouseId,
    pub quantity: i64,
}

impl TransferRequest {
    pub fn new(
        product_id: ProductId,
        from_warehouse: WarehouseId,
        to_warehouse: WarehouseId,
        quantity: i64,
    ) -> Self {
        Self {
            product_id,
            from_warehouse,
            to_warehouse,
            quantity,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.from_warehouse == self.to_warehouse {
            return Err(InventoryError::Validation(
                "source and destination warehouses must differ".to_string(),
            ));
        }
        if self.quantity <= 0 {
            return Err(InventoryError::Validation(format!(
                "transfer quantity must be positive, got {}",
                self.quantity
            )));
        }
        Ok(())
    }
}

/// Both rows as committed by a transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub request: TransferRequest,
    pub source: WarehouseStock,
    pub destination: WarehouseStock,
}

/// Moves unreserved stock between active warehouses.
pub struct TransferCoordinator<S: StockStore> {
    store: S,
    config: ReservationConfig,
}

impl<S: StockStore> TransferCoordinator<S> {
    pub fn new(store: S, config: ReservationConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Moves `quantity` units from the source to the destination warehouse.
    ///
    /// Only available stock at the source can move; reserved counters stay
    /// where they are. A missing destination row is created.
    #[tracing::instrument(skip(self), fields(product_id = %request.product_id))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferReceipt> {
        let result = match request.validate() {
            Ok(()) => {
                within_deadline(
                    self.config.request_timeout,
                    self.transfer_atomically(request),
                )
                .await
            }
            Err(err) => Err(err),
        };

        match &result {
            Ok(receipt) => {
                metrics::counter!("transfers_total", "outcome" => "moved").increment(1);
                tracing::info!(
                    source_quantity = receipt.source.quantity,
                    destination_quantity = receipt.destination.quantity,
                    "stock transferred"
                );
            }
            Err(err) => {
                metrics::counter!("transfers_total", "outcome" => err.kind().as_str())
                    .increment(1);
                tracing::warn!(error = %err, "transfer rejected");
            }
        }
        result
    }

    async fn transfer_atomically(&self, request: TransferRequest) -> Result<TransferReceipt> {
        let TransferRequest {
            product_id,
            from_warehouse,
            to_warehouse,
            quantity,
        } = request;
        let mut ledger = StockLedger::begin(&self.store).await?;

        let mut warehouses = [from_warehouse, to_warehouse];
        warehouses.sort();
        for warehouse_id in warehouses {
            let warehouse = ledger
                .lock_warehouse(warehouse_id)
                .await?
                .ok_or_else(|| InventoryError::warehouse_not_found(warehouse_id))?;
            if !warehouse.active {
                return Err(InventoryError::WarehouseInactive(warehouse_id));
            }
        }

        ledger.ensure_stock(to_warehouse, product_id).await?;
        let (source, destination) = ledger
            .lock_pair(product_id, from_warehouse, to_warehouse)
            .await?;
        let source = source.ok_or(InventoryError::StockNotFound {
            warehouse_id: from_warehouse,
            product_id,
        })?;
        let destination = destination.ok_or(InventoryError::StockNotFound {
            warehouse_id: to_warehouse,
            product_id,
        })?;

        if source.available() < quantity {
            return Err(InventoryError::InsufficientStock {
                product_id,
                requested: quantity,
                available: source.available(),
            });
        }

        let (source, destination) = ledger.move_quantity(source, destination, quantity).await?;
        ledger.commit().await?;

        Ok(TransferReceipt {
            request,
            source,
            destination,
        })
    }
}
