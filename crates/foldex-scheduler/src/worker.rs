//! Worker side of the lock protocol

use crate::{SchedulerError, SchedulerResult};
use foldex_core::{FolderIndexCoordinator, FolderKey};
use std::fmt::Display;
use std::future::Future;
use tracing::{debug, warn};

/// What happened to a folder handed to [`index_folder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The work ran and the folder was marked indexed
    Indexed,
    /// Another worker holds the folder's lock
    Skipped,
}

/// Run `work` for a folder under its indexing lock.
///
/// If the lock is held elsewhere the folder is skipped. Otherwise the lock
/// is released whether or not `work` succeeds; on success the folder is
/// marked indexed and its timestamp refreshed.
pub async fn index_folder<F, Fut, E>(
    coordinator: &FolderIndexCoordinator,
    key: &FolderKey,
    work: F,
) -> SchedulerResult<IndexOutcome>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    if !coordinator.lock(key).await? {
        debug!("Skipping {}: locked by another worker", key);
        return Ok(IndexOutcome::Skipped);
    }

    let result = work().await;
    if !coordinator.unlock(key).await? {
        warn!(
            "Lock on {} was released by someone else while indexing; it may have been indexed concurrently",
            key
        );
    }

    if let Err(e) = result {
        warn!("Indexing {} failed: {}", key, e);
        return Err(SchedulerError::IndexingFailed {
            key: key.clone(),
            message: e.to_string(),
        });
    }

    coordinator.set_indexed(key).await?;
    coordinator.set_timestamp(key, coordinator.now()).await?;
    Ok(IndexOutcome::Indexed)
}
