//! Background worker that keeps reservation lifetimes bounded.
//!
//! Connects the PostgreSQL stock ledger to the Redis expiry feed and runs the
//! expiry watcher until shutdown.

pub mod config;
pub mod error;
pub mod telemetry;

use std::future::Future;

use ledger::PostgresStockStore;
use reservations::{ExpiryWatcher, RedisNotifier};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

pub use config::{Config, LogFormat};
pub use error::WorkerError;

/// Runs the expiry watcher until `shutdown` resolves.
///
/// Migrations are applied before the watcher starts. Failing to enable
/// keyspace events is logged and tolerated, since the sweep still releases
/// expired reservations.
pub async fn run<F>(config: Config, shutdown: F) -> Result<(), WorkerError>
where
    F: Future<Output = ()>,
{
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    let store = PostgresStockStore::new(pool);
    store.run_migrations().await?;
    tracing::info!("database migrations applied");

    let notifier = RedisNotifier::connect(&config.redis_url)?;
    if config.configure_keyspace_events {
        if let Err(err) = notifier.enable_expiry_events().await {
            tracing::warn!(error = %err, "could not enable keyspace events, relying on the sweep");
        }
    }

    let watcher = ExpiryWatcher::new(store, notifier, config.watcher_config());
    let (stop, stopped) = watch::channel(false);
    let task = tokio::spawn(async move { watcher.run(stopped).await });

    shutdown.await;
    tracing::info!("stopping expiry watcher");
    let _ = stop.send(true);
    task.await?;
    Ok(())
}
