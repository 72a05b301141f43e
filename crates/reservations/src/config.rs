//! Tunables for the coordinators and the expiry watcher.

use std::time::Duration;

/// Default reservation window.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(300);

/// Settings shared by the request-path coordinators.
#[derive(Debug, Clone)]
pub struct ReservationConfig {
    /// How long a reservation may stay unsettled before it is released.
    pub ttl: Duration,
    /// Upper bound on one atomic unit. When exceeded the transaction is
    /// rolled back and the caller gets `DeadlineExceeded`.
    pub request_timeout: Option<Duration>,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_RESERVATION_TTL,
            request_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Settings for the expiry watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Period of the authoritative sweep over expired reservations.
    pub sweep_interval: Duration,
    /// Maximum number of orders released per sweep query.
    pub sweep_batch_size: usize,
    /// First delay before resubscribing after the feed fails.
    pub reconnect_min: Duration,
    /// Cap on the resubscribe delay.
    pub reconnect_max: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            sweep_batch_size: 100,
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}
