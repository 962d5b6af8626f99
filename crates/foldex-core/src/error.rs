//! Error types for the core module

use crate::FolderKey;
use thiserror::Error;

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// The record store cannot be reached (pool exhausted or closed,
    /// database busy past its timeout, connection I/O failure)
    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    /// A query or update failed for any other reason
    #[error("Record store error: {0}")]
    StoreIo(String),

    /// `unlock` was called for a folder that has no record
    #[error("No index entry for folder {0}")]
    MissingFolderEntry(FolderKey),

    /// The key has an empty folder id
    #[error("Invalid folder key {0}: folder id must not be empty")]
    InvalidFolderKey(FolderKey),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the caller may retry the operation with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::StoreUnavailable(_))
    }
}

/// SQLite primary result codes for a locked database
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_) => CoreError::StoreUnavailable(e.to_string()),
            sqlx::Error::Database(db) => {
                // Extended result codes keep the primary code in the low byte
                let busy = db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                    .unwrap_or(false);
                if busy {
                    CoreError::StoreUnavailable(e.to_string())
                } else {
                    CoreError::StoreIo(e.to_string())
                }
            }
            _ => CoreError::StoreIo(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(CoreError::from(sqlx::Error::PoolTimedOut).is_transient());
        assert!(CoreError::from(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn test_other_errors_are_not_transient() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::StoreIo(_)));
        assert!(!err.is_transient());

        let key = FolderKey::new(1, 2, 3, "acct", Some("INBOX"));
        assert!(!CoreError::MissingFolderEntry(key).is_transient());
    }
}
