//! Release of reservations that outlived their deadline.
//!
//! Two paths converge on [`ExpiryWatcher::release`]: best-effort signals
//! from an [`ExpiryFeed`] and a periodic sweep over reservation deadlines.
//! The sweep is authoritative, so a reservation is released even when its
//! signal is lost, and releasing an order twice is a no-op.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use ledger::{OrderId, Reservation, StockStore};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::backoff::Backoff;
use crate::config::WatcherConfig;
use crate::error::Result;
use crate::notify::{ExpiryFeed, ExpiryStream, NotifyError};
use crate::stock_ledger::StockLedger;

/// What caused a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseTrigger {
    Notification,
    Sweep,
    Manual,
}

impl ReleaseTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::Sweep => "sweep",
            Self::Manual => "manual",
        }
    }
}

/// Reservations returned to the available pool by one release.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReceipt {
    pub order_id: OrderId,
    pub released: Vec<Reservation>,
}

impl ReleaseReceipt {
    /// True when nothing was released: the order was already settled or
    /// released, or its reservations had not expired yet.
    pub fn is_noop(&self) -> bool {
        self.released.is_empty()
    }
}

/// Totals for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub released: usize,
    pub failed: usize,
}

/// Releases expired reservations, driven by a feed and a sweep.
pub struct ExpiryWatcher<S, F>
where
    S: StockStore,
    F: ExpiryFeed,
{
    store: S,
    feed: F,
    config: WatcherConfig,
}

impl<S, F> ExpiryWatcher<S, F>
where
    S: StockStore,
    F: ExpiryFeed,
{
    pub fn new(store: S, feed: F, config: WatcherConfig) -> Self {
        Self {
            store,
            feed,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns every reservation of an order to the available pool and
    /// deletes the rows. An order without reservations is left untouched.
    pub async fn release(&self, order_id: OrderId) -> Result<ReleaseReceipt> {
        self.release_with(order_id, ReleaseTrigger::Manual, None).await
    }

    /// Like [`ExpiryWatcher::release`], but only when the order's
    /// reservations expired at or before `now`. A live reservation, for
    /// instance one taken again after an earlier release, is left untouched
    /// and the receipt is a no-op.
    pub async fn release_expired(
        &self,
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseReceipt> {
        self.release_with(order_id, ReleaseTrigger::Manual, Some(now))
            .await
    }

    #[tracing::instrument(skip(self, trigger, expired_by), fields(trigger = trigger.as_str()))]
    async fn release_with(
        &self,
        order_id: OrderId,
        trigger: ReleaseTrigger,
        expired_by: Option<DateTime<Utc>>,
    ) -> Result<ReleaseReceipt> {
        let mut ledger = StockLedger::begin(&self.store).await?;

        let released = ledger.lock_reservations(order_id).await?;
        if released.is_empty() {
            tracing::debug!("nothing to release");
            return Ok(ReleaseReceipt { order_id, released });
        }
        if let Some(now) = expired_by {
            // Rows of one order are written by one reserve and share a deadline.
            if released.iter().any(|r| !r.is_expired(now)) {
                tracing::debug!("reservation still live, ignoring stale trigger");
                return Ok(ReleaseReceipt {
                    order_id,
                    released: Vec::new(),
                });
            }
        }

        for reservation in &released {
            match ledger
                .lock_stock(reservation.warehouse_id, reservation.product_id)
                .await?
            {
                Some(stock) => {
                    ledger.unreserve(stock, reservation.quantity).await?;
                }
                None => tracing::warn!(
                    warehouse_id = %reservation.warehouse_id,
                    product_id = %reservation.product_id,
                    "stock row missing, dropping reservation"
                ),
            }
        }
        ledger.delete_reservations(order_id).await?;
        ledger.commit().await?;

        metrics::counter!("reservations_released_total", "trigger" => trigger.as_str())
            .increment(released.len() as u64);
        tracing::info!(rows = released.len(), "reservations released");
        Ok(ReleaseReceipt { order_id, released })
    }

    /// Releases every order holding a reservation that expired before now.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Releases every order holding a reservation with a deadline before
    /// `now`, in batches of `sweep_batch_size`.
    ///
    /// A failing order is logged and skipped. The sweep stops early when a
    /// whole batch makes no progress, so the failing order is retried on
    /// the next sweep rather than in a loop.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = Instant::now();
        let batch_size = self.config.sweep_batch_size.max(1);
        let mut report = SweepReport::default();

        loop {
            let batch = self.store.expired_orders(now, batch_size).await?;
            let batch_len = batch.len();
            let mut progressed = false;

            for order_id in batch {
                match self
                    .release_with(order_id, ReleaseTrigger::Sweep, Some(now))
                    .await
                {
                    Ok(receipt) if !receipt.is_noop() => {
                        report.released += 1;
                        progressed = true;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        report.failed += 1;
                        tracing::error!(%order_id, error = %err, "failed to release expired order");
                    }
                }
            }

            if batch_len < batch_size || !progressed {
                break;
            }
        }

        metrics::histogram!("expiry_sweep_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        if report.released > 0 || report.failed > 0 {
            tracing::info!(
                released = report.released,
                failed = report.failed,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    ///
    /// Sweeps immediately and then every `sweep_interval`. Between sweeps it
    /// consumes the feed, resubscribing with exponential backoff whenever the
    /// subscription fails or ends.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            sweep_interval = ?self.config.sweep_interval,
            "expiry watcher started"
        );
        let mut sweep_timer = tokio::time::interval(self.config.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);
        let mut stream: Option<ExpiryStream> = None;
        let resubscribe = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(resubscribe);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sweep_timer.tick() => {
                    if let Err(err) = self.sweep().await {
                        tracing::error!(error = %err, "expiry sweep failed");
                    }
                }
                _ = &mut resubscribe, if stream.is_none() => {
                    match self.feed.subscribe().await {
                        Ok(subscribed) => {
                            tracing::info!("expiry feed connected");
                            stream = Some(subscribed);
                        }
                        Err(err) => {
                            let delay = backoff.next_delay();
                            metrics::counter!("expiry_feed_reconnects_total").increment(1);
                            tracing::warn!(error = %err, ?delay, "expiry feed subscribe failed");
                            resubscribe.as_mut().reset(tokio::time::Instant::now() + delay);
                        }
                    }
                }
                item = next_signal(&mut stream), if stream.is_some() => {
                    match item {
                        Some(Ok(order_id)) => {
                            backoff.reset();
                            self.handle_signal(order_id).await;
                        }
                        Some(Err(err)) => {
                            stream = None;
                            self.schedule_resubscribe(&mut backoff, resubscribe.as_mut(), &err);
                        }
                        None => {
                            stream = None;
                            self.schedule_resubscribe(
                                &mut backoff,
                                resubscribe.as_mut(),
                                &NotifyError::Disconnected,
                            );
                        }
                    }
                }
            }
        }
        tracing::info!("expiry watcher stopped");
    }

    async fn handle_signal(&self, order_id: OrderId) {
        match self
            .release_with(order_id, ReleaseTrigger::Notification, Some(Utc::now()))
            .await
        {
            Ok(receipt) if receipt.is_noop() => {
                tracing::debug!(%order_id, "expiry signal for order with nothing expired");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(%order_id, error = %err, "failed to release on expiry signal, the sweep will retry");
            }
        }
    }

    fn schedule_resubscribe(
        &self,
        backoff: &mut Backoff,
        resubscribe: std::pin::Pin<&mut tokio::time::Sleep>,
        err: &NotifyError,
    ) {
        let delay = backoff.next_delay();
        metrics::counter!("expiry_feed_reconnects_total").increment(1);
        tracing::warn!(error = %err, ?delay, "expiry feed lost, resubscribing");
        resubscribe.reset(tokio::time::Instant::now() + delay);
    }
}

async fn next_signal(
    stream: &mut Option<ExpiryStream>,
) -> Option<std::result::Result<OrderId, NotifyError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
