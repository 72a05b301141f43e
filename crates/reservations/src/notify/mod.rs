//! Best-effort reservation expiry signals.
//!
//! Notifications only make expiry prompt. Correctness comes from the sweep in
//! [`crate::expiry`], so a lost, late or duplicated signal is harmless.

mod keyspace;
mod memory;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use ledger::OrderId;
use thiserror::Error;

pub use keyspace::RedisNotifier;
pub use memory::InMemoryNotifier;

/// Prefix of the expiring key armed for each reserved order.
pub const RESERVATION_KEY_PREFIX: &str = "reservation:";

/// Errors raised by notification channels.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),

    #[error("Expiry feed disconnected")]
    Disconnected,
}

/// Expiry signals for reserved orders. The stream ends or yields an error when
/// the underlying subscription is lost.
pub type ExpiryStream = Pin<Box<dyn Stream<Item = Result<OrderId, NotifyError>> + Send>>;

/// Arms an expiry signal after a reservation commits.
#[async_trait]
pub trait ReservationNotifier: Send + Sync {
    /// Arms the signal for `order_id` to fire after `ttl`. Arming again
    /// replaces the previous deadline.
    async fn arm(&self, order_id: OrderId, ttl: Duration) -> Result<(), NotifyError>;
}

/// Source of expiry signals consumed by the watcher.
#[async_trait]
pub trait ExpiryFeed: Send + Sync {
    async fn subscribe(&self) -> Result<ExpiryStream, NotifyError>;
}

pub fn reservation_key(order_id: OrderId) -> String {
    format!("{RESERVATION_KEY_PREFIX}{order_id}")
}

/// Extracts the order id from an expired key. Keys with another prefix or a
/// malformed id yield `None`.
pub fn parse_reservation_key(key: &str) -> Option<OrderId> {
    key.strip_prefix(RESERVATION_KEY_PREFIX)?.parse().ok()
}
