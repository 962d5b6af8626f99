//! Keyed record stores backing the coordinator
//!
//! A store is a transactional table of [`FolderIndexRecord`]s keyed by
//! [`FolderKey`]. Plain operations run in their own implicit transaction;
//! [`KeyedRecordStore::begin`] opens an explicit one whose
//! [`StoreTransaction::get_for_update`] holds an exclusive lock on the row
//! until the transaction ends.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::{CoreResult, FolderIndexRecord, FolderKey, FolderScope, RecordMutation};
use async_trait::async_trait;

#[async_trait]
pub trait KeyedRecordStore: Send + Sync {
    async fn get(&self, key: &FolderKey) -> CoreResult<Option<FolderIndexRecord>>;

    /// Insert `record` unless its key already exists. Returns whether a row
    /// was created.
    async fn upsert_if_absent(&self, record: &FolderIndexRecord) -> CoreResult<bool>;

    /// Apply a mutation, returning the number of rows it changed
    async fn update(&self, key: &FolderKey, mutation: RecordMutation) -> CoreResult<u64>;

    async fn delete(&self, key: &FolderKey) -> CoreResult<u64>;

    async fn delete_many(&self, keys: &[FolderKey]) -> CoreResult<u64>;

    /// All records of a scope, ordered by folder
    async fn scan(&self, scope: &FolderScope) -> CoreResult<Vec<FolderIndexRecord>>;

    /// Locked records whose lease started before `lease_before`
    async fn scan_locked(&self, lease_before: i64) -> CoreResult<Vec<FolderIndexRecord>>;

    async fn begin(&self) -> CoreResult<Box<dyn StoreTransaction>>;
}

/// An open store transaction. Dropping it without committing rolls it back.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a row and hold it exclusively until commit or rollback
    async fn get_for_update(&mut self, key: &FolderKey) -> CoreResult<Option<FolderIndexRecord>>;

    async fn update(&mut self, key: &FolderKey, mutation: RecordMutation) -> CoreResult<u64>;

    async fn commit(&mut self) -> CoreResult<()>;

    async fn rollback(&mut self) -> CoreResult<()>;
}
