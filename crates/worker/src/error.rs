//! Worker error types.

use ledger::LedgerError;
use reservations::NotifyError;
use thiserror::Error;

/// Fatal errors that stop the worker process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stock ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Notification channel error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Metrics exporter failed: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("Expiry watcher task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
