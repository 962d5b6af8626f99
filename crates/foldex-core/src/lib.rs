//! Core of foldex: per-folder indexing locks and freshness tracking
//!
//! Provides the coordinator consulted by indexing workers, the record
//! stores it runs on, and configuration.

mod clock;
mod config;
mod coordinator;
mod error;
mod record;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FoldexConfig;
pub use coordinator::FolderIndexCoordinator;
pub use error::{CoreError, CoreResult};
pub use record::{FolderIndexRecord, FolderKey, FolderScope, RecordMutation, ATTACHMENT_MODULE};
pub use store::{KeyedRecordStore, MemoryStore, SqliteStore, StoreTransaction};
