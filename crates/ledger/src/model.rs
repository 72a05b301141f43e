//! Record types persisted by the stock store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LedgerError, OrderId, ProductId, Result, UserId, WarehouseId};

/// A catalog product. Prices are integer minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price_cents: i64,
    pub description: String,
}

/// Fields for inserting a new product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProduct {
    pub name: String,
    pub price_cents: i64,
    pub description: String,
}

impl NewProduct {
    pub fn new(name: impl Into<String>, price_cents: i64) -> Self {
        Self {
            name: name.into(),
            price_cents,
            description: String::new(),
        }
    }
}

/// A stock location. Only active warehouses take part in reservations and
/// transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warehouse {
    pub id: WarehouseId,
    pub name: String,
    pub active: bool,
}

/// Requested activation state of a warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseStatus {
    Active,
    Inactive,
}

impl WarehouseStatus {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

/// Returned when a status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown status '{0}'")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for WarehouseStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            // "deactive" is the spelling used by existing admin clients.
            "inactive" | "deactive" => Ok(Self::Inactive),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Order lifecycle. The only legal transition is `Pending -> Paid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }

    /// Parses a stored status column.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            other => Err(LedgerError::CorruptRecord(format!(
                "unknown order status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub total_amount: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// One line of an order, priced at order time. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: i64,
}

/// A requested product quantity, as submitted at checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl OrderLine {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// Stock of one product at one warehouse.
///
/// `quantity` counts physically present units, `reserved` the units held for
/// pending orders. Every committed row satisfies `0 <= reserved <= quantity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseStock {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub reserved: i64,
}

impl WarehouseStock {
    /// An empty row, as created for a transfer destination.
    pub fn empty(warehouse_id: WarehouseId, product_id: ProductId) -> Self {
        Self {
            warehouse_id,
            product_id,
            quantity: 0,
            reserved: 0,
        }
    }

    /// Units that can still be claimed, never negative.
    pub fn available(&self) -> i64 {
        (self.quantity - self.reserved).max(0)
    }

    /// Checks `0 <= reserved <= quantity`.
    pub fn check_invariant(&self) -> Result<()> {
        if self.reserved < 0 || self.reserved > self.quantity {
            return Err(LedgerError::InvariantViolation {
                warehouse_id: self.warehouse_id,
                product_id: self.product_id,
                quantity: self.quantity,
                reserved: self.reserved,
            });
        }
        Ok(())
    }

    /// Key used for canonical lock ordering.
    pub fn lock_key(&self) -> (ProductId, WarehouseId) {
        (self.product_id, self.warehouse_id)
    }
}

/// A time-bounded hold on stock for one order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn lock_key(&self) -> (ProductId, WarehouseId) {
        (self.product_id, self.warehouse_id)
    }
}

/// Per-product totals, derived from the warehouse rows on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub quantity: i64,
    pub reserved: i64,
    pub available: i64,
}

impl ProductStock {
    pub fn from_rows<'a>(
        product_id: ProductId,
        rows: impl IntoIterator<Item = &'a WarehouseStock>,
    ) -> Self {
        rows.into_iter()
            .filter(|row| row.product_id == product_id)
            .fold(
                Self {
                    product_id,
                    quantity: 0,
                    reserved: 0,
                    available: 0,
                },
                |acc, row| Self {
                    product_id,
                    quantity: acc.quantity + row.quantity,
                    reserved: acc.reserved + row.reserved,
                    available: acc.available + row.available(),
                },
            )
    }
}
