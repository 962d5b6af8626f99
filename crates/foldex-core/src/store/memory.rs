//! In-process record store
//!
//! Rows live in a sorted map. Each key has its own async mutex acting as the
//! row lock: transactions hold it from `get_for_update` until they finish,
//! and plain writes take it for the duration of the write, so writers of
//! different keys never wait on each other.

use super::{KeyedRecordStore, StoreTransaction};
use crate::{CoreError, CoreResult, FolderIndexRecord, FolderKey, FolderScope, RecordMutation};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

#[derive(Default)]
struct Shared {
    rows: Mutex<BTreeMap<FolderKey, FolderIndexRecord>>,
    row_locks: Mutex<HashMap<FolderKey, Arc<RowLock<()>>>>,
    unavailable: AtomicBool,
}

impl Shared {
    fn rows(&self) -> MutexGuard<'_, BTreeMap<FolderKey, FolderIndexRecord>> {
        // A panic while holding the map cannot leave a row half-written
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<FolderKey, Arc<RowLock<()>>>> {
        self.row_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock_row(self: &Arc<Self>, key: &FolderKey) -> RowGuard {
        let lock = self.locks().entry(key.clone()).or_default().clone();
        RowGuard {
            shared: self.clone(),
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn check_available(&self) -> CoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::StoreUnavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn apply(&self, key: &FolderKey, mutation: &RecordMutation) -> u64 {
        match self.rows().get_mut(key) {
            Some(record) => u64::from(record.apply(mutation)),
            None => 0,
        }
    }
}

/// Held row lock. The lock entry is dropped from the registry once nobody
/// holds or waits for it.
struct RowGuard {
    shared: Arc<Shared>,
    key: FolderKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Every holder and waiter owns a clone taken under the registry mutex
        let mut locks = self.shared.locks();
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Record store kept in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while offline every call fails with
    /// [`CoreError::StoreUnavailable`]
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.shared.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyedRecordStore for MemoryStore {
    async fn get(&self, key: &FolderKey) -> CoreResult<Option<FolderIndexRecord>> {
        self.shared.check_available()?;
        key.validate()?;
        Ok(self.shared.rows().get(key).cloned())
    }

    async fn upsert_if_absent(&self, record: &FolderIndexRecord) -> CoreResult<bool> {
        self.shared.check_available()?;
        record.key.validate()?;
        let _row = self.shared.lock_row(&record.key).await;
        let mut rows = self.shared.rows();
        if rows.contains_key(&record.key) {
            return Ok(false);
        }
        rows.insert(record.key.clone(), record.clone());
        Ok(true)
    }

    async fn update(&self, key: &FolderKey, mutation: RecordMutation) -> CoreResult<u64> {
        self.shared.check_available()?;
        key.validate()?;
        let _row = self.shared.lock_row(key).await;
        Ok(self.shared.apply(key, &mutation))
    }

    async fn delete(&self, key: &FolderKey) -> CoreResult<u64> {
        self.shared.check_available()?;
        key.validate()?;
        let _row = self.shared.lock_row(key).await;
        Ok(u64::from(self.shared.rows().remove(key).is_some()))
    }

    async fn delete_many(&self, keys: &[FolderKey]) -> CoreResult<u64> {
        self.shared.check_available()?;
        for key in keys {
            key.validate()?;
        }
        let mut count = 0;
        for key in keys {
            let _row = self.shared.lock_row(key).await;
            count += u64::from(self.shared.rows().remove(key).is_some());
        }
        Ok(count)
    }

    async fn scan(&self, scope: &FolderScope) -> CoreResult<Vec<FolderIndexRecord>> {
        self.shared.check_available()?;
        Ok(self
            .shared
            .rows()
            .values()
            .filter(|record| record.key.in_scope(scope))
            .cloned()
            .collect())
    }

    async fn scan_locked(&self, lease_before: i64) -> CoreResult<Vec<FolderIndexRecord>> {
        self.shared.check_available()?;
        Ok(self
            .shared
            .rows()
            .values()
            .filter(|record| record.locked && record.lease_start() < lease_before)
            .cloned()
            .collect())
    }

    async fn begin(&self) -> CoreResult<Box<dyn StoreTransaction>> {
        self.shared.check_available()?;
        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            held: HashMap::new(),
            undo: Vec::new(),
            finished: false,
        }))
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    held: HashMap<FolderKey, RowGuard>,
    /// Pre-images of touched rows, oldest first
    undo: Vec<(FolderKey, Option<FolderIndexRecord>)>,
    finished: bool,
}

impl MemoryTransaction {
    fn check_open(&self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::StoreIo("transaction already finished".into()));
        }
        self.shared.check_available()
    }

    async fn hold(&mut self, key: &FolderKey) {
        if !self.held.contains_key(key) {
            let guard = self.shared.lock_row(key).await;
            self.held.insert(key.clone(), guard);
        }
    }

    fn restore(&mut self) {
        let mut rows = self.shared.rows();
        for (key, before) in self.undo.drain(..).rev() {
            match before {
                Some(record) => rows.insert(key, record),
                None => rows.remove(&key),
            };
        }
    }

    fn release(&mut self) {
        self.finished = true;
        self.held.clear();
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get_for_update(&mut self, key: &FolderKey) -> CoreResult<Option<FolderIndexRecord>> {
        self.check_open()?;
        key.validate()?;
        self.hold(key).await;
        Ok(self.shared.rows().get(key).cloned())
    }

    async fn update(&mut self, key: &FolderKey, mutation: RecordMutation) -> CoreResult<u64> {
        self.check_open()?;
        key.validate()?;
        self.hold(key).await;
        let before = self.shared.rows().get(key).cloned();
        let changed = self.shared.apply(key, &mutation);
        if changed > 0 {
            self.undo.push((key.clone(), before));
        }
        Ok(changed)
    }

    async fn commit(&mut self) -> CoreResult<()> {
        self.check_open()?;
        self.undo.clear();
        self.release();
        Ok(())
    }

    async fn rollback(&mut self) -> CoreResult<()> {
        if self.finished {
            return Err(CoreError::StoreIo("transaction already finished".into()));
        }
        self.restore();
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(folder: &str) -> FolderKey {
        FolderKey::new(1, 2, 19, "default0", Some(folder))
    }

    #[tokio::test]
    async fn test_rollback_restores_rows() {
        let store = MemoryStore::new();
        store.upsert_if_absent(&FolderIndexRecord::fresh(key("INBOX"), 10)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.get_for_update(&key("INBOX")).await.unwrap();
        tx.update(&key("INBOX"), RecordMutation::Indexed(true)).await.unwrap();
        tx.update(&key("INBOX"), RecordMutation::Timestamp(99)).await.unwrap();
        tx.rollback().await.unwrap();

        let record = store.get(&key("INBOX")).await.unwrap().unwrap();
        assert!(!record.indexed);
        assert_eq!(record.timestamp, 10);
    }

    #[tokio::test]
    async fn test_row_lock_blocks_writers_of_same_key_only() {
        let store = MemoryStore::new();
        store.upsert_if_absent(&FolderIndexRecord::fresh(key("INBOX"), 10)).await.unwrap();
        store.upsert_if_absent(&FolderIndexRecord::fresh(key("Sent"), 10)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.get_for_update(&key("INBOX")).await.unwrap();

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            store.update(&key("Sent"), RecordMutation::Indexed(true)),
        )
        .await;
        assert_eq!(other.unwrap().unwrap(), 1);

        let same = tokio::time::timeout(
            Duration::from_millis(50),
            store.update(&key("INBOX"), RecordMutation::Indexed(true)),
        )
        .await;
        assert!(same.is_err());

        tx.commit().await.unwrap();
        assert_eq!(
            store.update(&key("INBOX"), RecordMutation::Indexed(true)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_offline_store_fails_as_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get(&key("INBOX")).await,
            Err(CoreError::StoreUnavailable(_))
        ));
        store.set_available(true);
        assert!(store.get(&key("INBOX")).await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_row_locks_are_released_from_registry() {
        let store = MemoryStore::new();
        for n in 0..100 {
            let folder = format!("Folder{n}");
            store.upsert_if_absent(&FolderIndexRecord::fresh(key(&folder), 10)).await.unwrap();

            let mut tx = store.begin().await.unwrap();
            tx.get_for_update(&key(&folder)).await.unwrap();
            tx.update(&key(&folder), RecordMutation::Lock { acquired_at: 20 }).await.unwrap();
            tx.commit().await.unwrap();

            store.update(&key(&folder), RecordMutation::Unlock).await.unwrap();
            store.delete(&key(&folder)).await.unwrap();
        }

        // Exclusive reads of missing keys, finished or abandoned
        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_for_update(&key("Missing")).await.unwrap().is_none());
        tx.commit().await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.get_for_update(&key("Dropped")).await.unwrap();
        drop(tx);

        assert!(store.is_empty());
        assert!(store.shared.locks().is_empty());
    }

    #[tokio::test]
    async fn test_contended_row_lock_survives_first_release() {
        let store = MemoryStore::new();
        store.upsert_if_absent(&FolderIndexRecord::fresh(key("INBOX"), 10)).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.get_for_update(&key("INBOX")).await.unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.update(&key("INBOX"), RecordMutation::Indexed(true)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        tx.commit().await.unwrap();
        assert_eq!(writer.await.unwrap().unwrap(), 1);
        assert!(store.shared.locks().is_empty());
    }

    #[tokio::test]
    async fn test_empty_folder_id_is_rejected() {
        let store = MemoryStore::new();
        let empty = key("");
        assert!(matches!(
            store.upsert_if_absent(&FolderIndexRecord::fresh(empty.clone(), 10)).await,
            Err(CoreError::InvalidFolderKey(_))
        ));
        assert!(matches!(store.get(&empty).await, Err(CoreError::InvalidFolderKey(_))));

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.get_for_update(&empty).await,
            Err(CoreError::InvalidFolderKey(_))
        ));
        tx.rollback().await.unwrap();
        assert!(store.is_empty());
    }
}
