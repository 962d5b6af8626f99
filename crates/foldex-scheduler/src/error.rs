//! Error types for the scheduler module

use foldex_core::{CoreError, FolderKey};
use thiserror::Error;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while scheduling or running index jobs
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Coordinator or record store failure
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The indexing work itself failed; the folder lock was released
    #[error("Indexing {key} failed: {message}")]
    IndexingFailed { key: FolderKey, message: String },

    /// The receiving side of a channel went away
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),
}
