use std::future::Future;
use std::time::Duration;

use crate::error::{InventoryError, Result};

/// Runs one atomic unit under an optional deadline.
///
/// On timeout the unit's future is dropped, which drops its open transaction
/// and rolls back everything it wrote.
pub(crate) async fn within_deadline<T, F>(limit: Option<Duration>, unit: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, unit)
            .await
            .map_err(|_| InventoryError::DeadlineExceeded(limit))?,
        None => unit.await,
    }
}
