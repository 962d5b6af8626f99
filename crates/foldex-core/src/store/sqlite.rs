//! Record store on SQLite
//!
//! SQLite has no row locks, so transactions are opened with
//! `BEGIN IMMEDIATE`: the reserved lock taken up front makes every
//! `get_for_update` exclusive against all other writers until commit.
//! Competing connections wait up to the configured busy timeout.

use super::{KeyedRecordStore, StoreTransaction};
use crate::{
    CoreError, CoreResult, FolderIndexRecord, FolderKey, FolderScope, FoldexConfig,
    RecordMutation,
};
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use tracing::{debug, info};

/// `WHERE` clause matching one primary key
macro_rules! key_predicate {
    () => {
        "cid = ? AND uid = ? AND module = ? AND account = ? AND folder = ?"
    };
}

macro_rules! select_columns {
    () => {
        "SELECT cid, uid, module, account, folder, timestamp, locked, indexed, lock_acquired FROM indexed_folders"
    };
}

#[derive(Debug, sqlx::FromRow)]
struct FolderRow {
    cid: i32,
    uid: i32,
    module: i32,
    account: String,
    folder: String,
    timestamp: i64,
    locked: bool,
    indexed: bool,
    lock_acquired: Option<i64>,
}

impl From<FolderRow> for FolderIndexRecord {
    fn from(row: FolderRow) -> Self {
        FolderIndexRecord {
            key: FolderKey {
                context_id: row.cid,
                user_id: row.uid,
                module: row.module,
                account: row.account,
                // Primary key columns cannot be NULL; '' marks the module entry
                folder: (!row.folder.is_empty()).then_some(row.folder),
            },
            indexed: row.indexed,
            locked: row.locked,
            timestamp: row.timestamp,
            lock_acquired: row.lock_acquired,
        }
    }
}

fn folder_column(key: &FolderKey) -> &str {
    key.folder.as_deref().unwrap_or("")
}

/// Bind the primary key columns, in `key_predicate!` order
macro_rules! bind_key {
    ($query:expr, $key:expr) => {
        $query
            .bind($key.context_id)
            .bind($key.user_id)
            .bind($key.module)
            .bind($key.account.as_str())
            .bind(folder_column($key))
    };
}

fn mutation_query(key: &FolderKey, mutation: RecordMutation) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    let query = match mutation {
        RecordMutation::Indexed(indexed) => {
            sqlx::query(concat!("UPDATE indexed_folders SET indexed = ? WHERE ", key_predicate!()))
                .bind(indexed)
        }
        RecordMutation::Timestamp(timestamp) => {
            sqlx::query(concat!("UPDATE indexed_folders SET timestamp = ? WHERE ", key_predicate!()))
                .bind(timestamp)
        }
        RecordMutation::Lock { acquired_at } => sqlx::query(concat!(
            "UPDATE indexed_folders SET locked = 1, lock_acquired = ? WHERE locked = 0 AND ",
            key_predicate!()
        ))
        .bind(acquired_at),
        RecordMutation::Unlock => sqlx::query(concat!(
            "UPDATE indexed_folders SET locked = 0, lock_acquired = NULL WHERE locked = 1 AND ",
            key_predicate!()
        )),
    };
    bind_key!(query, key)
}

/// SQLite-backed record store
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open or create the database named in `config`
    pub async fn open(config: &FoldexConfig) -> CoreResult<Self> {
        let path = config.database_path.as_path();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Opening index database at {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Open an in-memory database (for testing)
    pub async fn open_memory() -> CoreResult<Self> {
        // A single connection that never expires, or the database goes with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::from_pool(pool).await
    }

    /// Use an existing pool, creating the schema if needed
    pub async fn from_pool(pool: Pool<Sqlite>) -> CoreResult<Self> {
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Initialize the database schema
    async fn initialize(&self) -> CoreResult<()> {
        debug!("Initializing index schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS indexed_folders (
                cid INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                module INTEGER NOT NULL,
                account TEXT NOT NULL,
                folder TEXT NOT NULL DEFAULT '',
                timestamp INTEGER NOT NULL,
                locked INTEGER NOT NULL DEFAULT 0,
                indexed INTEGER NOT NULL DEFAULT 0,
                lock_acquired INTEGER,
                PRIMARY KEY (cid, uid, module, account, folder)
            );

            CREATE INDEX IF NOT EXISTS idx_indexed_folders_locked
                ON indexed_folders(locked) WHERE locked = 1;
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.migrate_add_lock_acquired().await?;

        info!("Index schema initialized");
        Ok(())
    }

    /// Add the lock_acquired column to tables created before lock leases
    async fn migrate_add_lock_acquired(&self) -> CoreResult<()> {
        let result = sqlx::query("SELECT lock_acquired FROM indexed_folders LIMIT 1")
            .fetch_optional(&self.pool)
            .await;

        if result.is_err() {
            debug!("Migrating index database: adding lock_acquired column");
            sqlx::query("ALTER TABLE indexed_folders ADD COLUMN lock_acquired INTEGER")
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KeyedRecordStore for SqliteStore {
    async fn get(&self, key: &FolderKey) -> CoreResult<Option<FolderIndexRecord>> {
        key.validate()?;
        let row = bind_key!(
            sqlx::query_as::<_, FolderRow>(concat!(select_columns!(), " WHERE ", key_predicate!())),
            key
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FolderIndexRecord::from))
    }

    async fn upsert_if_absent(&self, record: &FolderIndexRecord) -> CoreResult<bool> {
        let key = &record.key;
        key.validate()?;
        let result = sqlx::query(
            r#"
            INSERT INTO indexed_folders (cid, uid, module, account, folder, timestamp, locked, indexed, lock_acquired)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cid, uid, module, account, folder) DO NOTHING
            "#,
        )
        .bind(key.context_id)
        .bind(key.user_id)
        .bind(key.module)
        .bind(key.account.as_str())
        .bind(folder_column(key))
        .bind(record.timestamp)
        .bind(record.locked)
        .bind(record.indexed)
        .bind(record.lock_acquired)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, key: &FolderKey, mutation: RecordMutation) -> CoreResult<u64> {
        key.validate()?;
        let result = mutation_query(key, mutation).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, key: &FolderKey) -> CoreResult<u64> {
        key.validate()?;
        let result = bind_key!(
            sqlx::query(concat!("DELETE FROM indexed_folders WHERE ", key_predicate!())),
            key
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_many(&self, keys: &[FolderKey]) -> CoreResult<u64> {
        for key in keys {
            key.validate()?;
        }
        let mut tx = self.pool.begin().await?;
        let mut count = 0;

        for key in keys {
            let result = bind_key!(
                sqlx::query(concat!("DELETE FROM indexed_folders WHERE ", key_predicate!())),
                key
            )
            .execute(&mut *tx)
            .await?;
            count += result.rows_affected();
        }

        tx.commit().await?;
        debug!("Deleted {} of {} folder entries", count, keys.len());
        Ok(count)
    }

    async fn scan(&self, scope: &FolderScope) -> CoreResult<Vec<FolderIndexRecord>> {
        let rows = sqlx::query_as::<_, FolderRow>(concat!(
            select_columns!(),
            " WHERE cid = ? AND uid = ? AND module = ? AND account = ? ORDER BY folder"
        ))
        .bind(scope.context_id)
        .bind(scope.user_id)
        .bind(scope.module)
        .bind(scope.account.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FolderIndexRecord::from).collect())
    }

    async fn scan_locked(&self, lease_before: i64) -> CoreResult<Vec<FolderIndexRecord>> {
        let rows = sqlx::query_as::<_, FolderRow>(concat!(
            select_columns!(),
            " WHERE locked = 1 AND COALESCE(lock_acquired, timestamp) < ?",
            " ORDER BY cid, uid, module, account, folder"
        ))
        .bind(lease_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FolderIndexRecord::from).collect())
    }

    async fn begin(&self) -> CoreResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteTransaction { tx: Some(tx) }))
    }
}

struct SqliteTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteTransaction {
    fn open(&mut self) -> CoreResult<&mut Transaction<'static, Sqlite>> {
        self.tx
            .as_mut()
            .ok_or_else(|| CoreError::StoreIo("transaction already finished".into()))
    }

    fn finish(&mut self) -> CoreResult<Transaction<'static, Sqlite>> {
        self.tx
            .take()
            .ok_or_else(|| CoreError::StoreIo("transaction already finished".into()))
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn get_for_update(&mut self, key: &FolderKey) -> CoreResult<Option<FolderIndexRecord>> {
        key.validate()?;
        let tx = self.open()?;
        let row = bind_key!(
            sqlx::query_as::<_, FolderRow>(concat!(select_columns!(), " WHERE ", key_predicate!())),
            key
        )
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(FolderIndexRecord::from))
    }

    async fn update(&mut self, key: &FolderKey, mutation: RecordMutation) -> CoreResult<u64> {
        key.validate()?;
        let tx = self.open()?;
        let result = mutation_query(key, mutation).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> CoreResult<()> {
        self.finish()?.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> CoreResult<()> {
        self.finish()?.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_module_entry_round_trips_null_folder() {
        let store = SqliteStore::open_memory().await.unwrap();
        let key = FolderKey::new(1, 2, 19, "default0", None);

        assert!(store.upsert_if_absent(&FolderIndexRecord::fresh(key.clone(), 10)).await.unwrap());
        assert!(!store.upsert_if_absent(&FolderIndexRecord::fresh(key.clone(), 20)).await.unwrap());

        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.key, key);
        assert_eq!(record.timestamp, 10);
    }

    #[tokio::test]
    async fn test_empty_folder_id_does_not_alias_module_entry() {
        let store = SqliteStore::open_memory().await.unwrap();
        let module_entry = FolderKey::new(1, 2, 19, "default0", None);
        let empty = FolderKey::new(1, 2, 19, "default0", Some(""));
        store.upsert_if_absent(&FolderIndexRecord::fresh(module_entry.clone(), 10)).await.unwrap();

        assert!(matches!(store.get(&empty).await, Err(CoreError::InvalidFolderKey(_))));
        assert!(matches!(
            store.update(&empty, RecordMutation::Indexed(true)).await,
            Err(CoreError::InvalidFolderKey(_))
        ));
        assert!(matches!(
            store.delete_many(&[module_entry.clone(), empty.clone()]).await,
            Err(CoreError::InvalidFolderKey(_))
        ));

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.get_for_update(&empty).await,
            Err(CoreError::InvalidFolderKey(_))
        ));
        tx.rollback().await.unwrap();

        let record = store.get(&module_entry).await.unwrap().unwrap();
        assert!(!record.indexed);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = SqliteStore::open_memory().await.unwrap();
        let key = FolderKey::new(1, 2, 19, "default0", Some("INBOX"));
        store.upsert_if_absent(&FolderIndexRecord::fresh(key.clone(), 10)).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.get_for_update(&key).await.unwrap().is_some());
            assert_eq!(tx.update(&key, RecordMutation::Lock { acquired_at: 11 }).await.unwrap(), 1);
        }

        let record = store.get(&key).await.unwrap().unwrap();
        assert!(!record.locked);
        assert_eq!(record.lock_acquired, None);
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_use() {
        let store = SqliteStore::open_memory().await.unwrap();
        let key = FolderKey::new(1, 2, 19, "default0", Some("INBOX"));

        let mut tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert!(matches!(tx.get_for_update(&key).await, Err(CoreError::StoreIo(_))));
        assert!(matches!(tx.rollback().await, Err(CoreError::StoreIo(_))));
    }

    #[tokio::test]
    async fn test_adds_lock_acquired_to_old_schema() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE indexed_folders (
                cid INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                module INTEGER NOT NULL,
                account TEXT NOT NULL,
                folder TEXT NOT NULL DEFAULT '',
                timestamp INTEGER NOT NULL,
                locked INTEGER NOT NULL DEFAULT 0,
                indexed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (cid, uid, module, account, folder)
            );
            INSERT INTO indexed_folders (cid, uid, module, account, folder, timestamp, locked, indexed)
            VALUES (1, 2, 19, 'default0', 'INBOX', 500, 1, 1);
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let store = SqliteStore::from_pool(pool).await.unwrap();
        let locked = store.scan_locked(1_000).await.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].lock_acquired, None);
        assert_eq!(locked[0].lease_start(), 500);
        assert!(locked[0].indexed);
    }
}
