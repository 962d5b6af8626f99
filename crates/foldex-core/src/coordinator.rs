//! Per-folder indexing lock and freshness coordinator
//!
//! Indexing workers call [`FolderIndexCoordinator::lock`] before indexing a
//! folder and [`FolderIndexCoordinator::unlock`] afterwards, then record the
//! result with `set_indexed`/`set_timestamp`. Records are created lazily by
//! the read paths (`is_indexed`, `is_locked`, `lock`, `get_timestamp`);
//! plain mutators never create them.

use crate::store::{KeyedRecordStore, StoreTransaction};
use crate::{
    Clock, CoreError, CoreResult, FolderIndexRecord, FolderKey, FolderScope, FoldexConfig,
    RecordMutation, SystemClock, ATTACHMENT_MODULE,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one exclusive read inside `lock`
enum LockAttempt {
    Missing,
    Held,
    Acquired(bool),
}

pub struct FolderIndexCoordinator {
    store: Arc<dyn KeyedRecordStore>,
    clock: Arc<dyn Clock>,
    always_indexed_module: Option<i32>,
}

impl FolderIndexCoordinator {
    /// Create a coordinator on the wall clock, treating attachments as
    /// always indexed
    pub fn new(store: Arc<dyn KeyedRecordStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            always_indexed_module: Some(ATTACHMENT_MODULE),
        }
    }

    pub fn from_config(store: Arc<dyn KeyedRecordStore>, config: &FoldexConfig) -> Self {
        Self::new(store).with_always_indexed_module(config.always_indexed_module)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_always_indexed_module(mut self, module: Option<i32>) -> Self {
        self.always_indexed_module = module;
        self
    }

    /// Current time of the coordinator's clock, epoch millis
    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    fn is_always_indexed(&self, module: i32) -> bool {
        self.always_indexed_module == Some(module)
    }

    /// Read a record, creating a default one for unseen folder keys
    async fn read_or_create(&self, key: &FolderKey) -> CoreResult<Option<FolderIndexRecord>> {
        let record = self.store.get(key).await?;
        if record.is_none() && key.folder.is_some() {
            self.create_folder_entry(key).await?;
        }
        Ok(record)
    }

    pub async fn is_indexed(&self, key: &FolderKey) -> CoreResult<bool> {
        if self.is_always_indexed(key.module) {
            return Ok(true);
        }
        Ok(self
            .read_or_create(key)
            .await?
            .map(|record| record.indexed)
            .unwrap_or(false))
    }

    pub async fn is_locked(&self, key: &FolderKey) -> CoreResult<bool> {
        Ok(self
            .read_or_create(key)
            .await?
            .map(|record| record.locked)
            .unwrap_or(false))
    }

    /// Mark a folder as fully indexed. Returns false if it has no record.
    pub async fn set_indexed(&self, key: &FolderKey) -> CoreResult<bool> {
        Ok(self.store.update(key, RecordMutation::Indexed(true)).await? > 0)
    }

    /// Clear the indexed flag. Returns false if the folder has no record.
    pub async fn unset_indexed(&self, key: &FolderKey) -> CoreResult<bool> {
        Ok(self.store.update(key, RecordMutation::Indexed(false)).await? > 0)
    }

    /// Try to take the indexing lock of a folder.
    ///
    /// Returns `Ok(false)` when another worker holds it; that is the normal
    /// outcome of contention, not an error.
    pub async fn lock(&self, key: &FolderKey) -> CoreResult<bool> {
        let mut created = false;
        loop {
            let mut tx = self.store.begin().await?;
            let attempt = match self.try_lock(&mut *tx, key).await {
                Ok(attempt) => attempt,
                Err(e) => {
                    abort(tx, key).await;
                    return Err(e);
                }
            };
            tx.commit().await?;

            match attempt {
                LockAttempt::Acquired(acquired) => {
                    debug!("Lock on {}: {}", key, if acquired { "acquired" } else { "lost" });
                    return Ok(acquired);
                }
                LockAttempt::Held => {
                    debug!("Lock on {} is held elsewhere", key);
                    return Ok(false);
                }
                LockAttempt::Missing if !created => {
                    self.create_folder_entry(key).await?;
                    created = true;
                }
                LockAttempt::Missing => {
                    return Err(CoreError::StoreIo(format!(
                        "index entry for {} disappeared after creation",
                        key
                    )));
                }
            }
        }
    }

    async fn try_lock(
        &self,
        tx: &mut dyn StoreTransaction,
        key: &FolderKey,
    ) -> CoreResult<LockAttempt> {
        let record = match tx.get_for_update(key).await? {
            Some(record) => record,
            None => return Ok(LockAttempt::Missing),
        };
        if record.locked {
            return Ok(LockAttempt::Held);
        }

        let acquired_at = self.now();
        let rows = tx.update(key, RecordMutation::Lock { acquired_at }).await?;
        if rows != 1 {
            warn!(
                "Conditional lock of {} changed {} rows under an exclusive read; store isolation is too weak",
                key, rows
            );
        }
        Ok(LockAttempt::Acquired(rows == 1))
    }

    /// Release the indexing lock of a folder. Returns false if it was not
    /// locked, and [`CoreError::MissingFolderEntry`] if it has no record.
    pub async fn unlock(&self, key: &FolderKey) -> CoreResult<bool> {
        let mut tx = self.store.begin().await?;
        let released = match Self::try_unlock(&mut *tx, key, None).await {
            Ok(Some(released)) => released,
            Ok(None) => {
                abort(tx, key).await;
                return Err(CoreError::MissingFolderEntry(key.clone()));
            }
            Err(e) => {
                abort(tx, key).await;
                return Err(e);
            }
        };
        tx.commit().await?;

        debug!("Unlock of {}: {}", key, released);
        Ok(released)
    }

    /// Exclusive read and conditional unlock. `None` if the record is
    /// missing. With `lease_before`, only a lock whose lease started before
    /// that instant is released.
    async fn try_unlock(
        tx: &mut dyn StoreTransaction,
        key: &FolderKey,
        lease_before: Option<i64>,
    ) -> CoreResult<Option<bool>> {
        let record = match tx.get_for_update(key).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        if let Some(cutoff) = lease_before {
            if !record.locked || record.lease_start() >= cutoff {
                return Ok(Some(false));
            }
        }

        let rows = tx.update(key, RecordMutation::Unlock).await?;
        if record.locked && rows != 1 {
            warn!(
                "Conditional unlock of {} changed {} rows under an exclusive read; store isolation is too weak",
                key, rows
            );
        }
        Ok(Some(rows == 1))
    }

    /// Record when a folder was last indexed. Returns false if it has no
    /// record.
    pub async fn set_timestamp(&self, key: &FolderKey, timestamp: i64) -> CoreResult<bool> {
        Ok(self.store.update(key, RecordMutation::Timestamp(timestamp)).await? > 0)
    }

    /// Last index time of a folder, creating its record if needed
    pub async fn get_timestamp(&self, key: &FolderKey) -> CoreResult<i64> {
        if let Some(record) = self.store.get(key).await? {
            return Ok(record.timestamp);
        }
        self.create_folder_entry(key).await?;
        match self.store.get(key).await? {
            Some(record) => Ok(record.timestamp),
            None => Err(CoreError::StoreIo(format!(
                "index entry for {} disappeared after creation",
                key
            ))),
        }
    }

    /// Indexed flag of every tracked folder of a scope
    pub async fn get_indexed_folders(&self, scope: &FolderScope) -> CoreResult<HashMap<String, bool>> {
        let records = self.store.scan(scope).await?;
        Ok(records
            .into_iter()
            .filter_map(|record| record.key.folder.map(|folder| (folder, record.indexed)))
            .collect())
    }

    /// Folders of a scope whose last index time is before `threshold`
    pub async fn get_elapsed_folders(
        &self,
        scope: &FolderScope,
        threshold: i64,
    ) -> CoreResult<Vec<String>> {
        let records = self.store.scan(scope).await?;
        Ok(records
            .into_iter()
            .filter(|record| record.timestamp < threshold)
            .filter_map(|record| record.key.folder)
            .collect())
    }

    pub async fn delete_folder_entry(&self, key: &FolderKey) -> CoreResult<bool> {
        Ok(self.store.delete(key).await? > 0)
    }

    /// Remove the records of folders that no longer exist
    pub async fn delete_folder_entries(&self, keys: &[FolderKey]) -> CoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.store.delete_many(keys).await
    }

    /// Forget renamed or moved folders. Both the old and the new folder ids
    /// lose their records, so the next access starts them from scratch.
    pub async fn remap_folders(
        &self,
        scope: &FolderScope,
        renames: &[(String, String)],
    ) -> CoreResult<u64> {
        let keys: Vec<FolderKey> = renames
            .iter()
            .flat_map(|(old, new)| [scope.folder(old.as_str()), scope.folder(new.as_str())])
            .collect();
        let removed = self.delete_folder_entries(&keys).await?;
        debug!("Remapped {} folders in {}, removed {} entries", renames.len(), scope, removed);
        Ok(removed)
    }

    /// Remove every record of an account
    pub async fn delete_account_entries(&self, scope: &FolderScope) -> CoreResult<u64> {
        let keys: Vec<FolderKey> = self
            .store
            .scan(scope)
            .await?
            .into_iter()
            .map(|record| record.key)
            .collect();
        let removed = self.delete_folder_entries(&keys).await?;
        info!("Removed {} index entries of {}", removed, scope);
        Ok(removed)
    }

    /// Create the default record of a folder if it has none
    pub async fn create_folder_entry(&self, key: &FolderKey) -> CoreResult<bool> {
        let record = FolderIndexRecord::fresh(key.clone(), self.now());
        let created = self.store.upsert_if_absent(&record).await?;
        if created {
            debug!("Created index entry for {}", key);
        }
        Ok(created)
    }

    /// Force-release locks held for longer than `ttl`, returning the folders
    /// that were released. Each release re-checks the lease under an
    /// exclusive read, so a lock taken again since the scan is left alone.
    pub async fn sweep_expired_locks(&self, ttl: Duration) -> CoreResult<Vec<FolderKey>> {
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = self.now().saturating_sub(ttl_millis);
        let candidates = self.store.scan_locked(cutoff).await?;

        let mut released = Vec::new();
        for record in candidates {
            let key = record.key;
            match self.release_expired(&key, cutoff).await {
                Ok(true) => {
                    warn!("Released expired lock on {}", key);
                    released.push(key);
                }
                Ok(false) => {}
                Err(e) => {
                    if !released.is_empty() {
                        let keys: Vec<String> = released.iter().map(ToString::to_string).collect();
                        warn!(
                            "Lock sweep failed at {} after releasing {} locks: {}",
                            key,
                            released.len(),
                            keys.join(", ")
                        );
                    }
                    return Err(e);
                }
            }
        }

        if !released.is_empty() {
            info!("Swept {} expired folder locks", released.len());
        }
        Ok(released)
    }

    /// Release one lock if its lease still started before `cutoff`
    async fn release_expired(&self, key: &FolderKey, cutoff: i64) -> CoreResult<bool> {
        let mut tx = self.store.begin().await?;
        match Self::try_unlock(&mut *tx, key, Some(cutoff)).await {
            Ok(released) => {
                tx.commit().await?;
                Ok(released == Some(true))
            }
            Err(e) => {
                abort(tx, key).await;
                Err(e)
            }
        }
    }
}

/// Roll back after a failure; the original error is what the caller sees
async fn abort(mut tx: Box<dyn StoreTransaction>, key: &FolderKey) {
    if let Err(e) = tx.rollback().await {
        warn!("Rollback for {} failed: {}", key, e);
    }
}
