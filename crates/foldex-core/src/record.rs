//! Folder index records and their keys

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Module identifier of attachments, which are always considered indexed
pub const ATTACHMENT_MODULE: i32 = 6;

/// All folders of one account within a module, for one user of a context
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderScope {
    pub context_id: i32,
    pub user_id: i32,
    pub module: i32,
    pub account: String,
}

impl FolderScope {
    pub fn new(context_id: i32, user_id: i32, module: i32, account: impl Into<String>) -> Self {
        Self {
            context_id,
            user_id,
            module,
            account: account.into(),
        }
    }

    /// Key of a folder inside this scope
    pub fn folder(&self, folder: impl Into<String>) -> FolderKey {
        FolderKey {
            context_id: self.context_id,
            user_id: self.user_id,
            module: self.module,
            account: self.account.clone(),
            folder: Some(folder.into()),
        }
    }

    /// Key of the module-level record of this scope (no folder)
    pub fn module_entry(&self) -> FolderKey {
        FolderKey {
            context_id: self.context_id,
            user_id: self.user_id,
            module: self.module,
            account: self.account.clone(),
            folder: None,
        }
    }
}

impl fmt::Display for FolderScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.context_id, self.user_id, self.module, self.account
        )
    }
}

/// Primary key of a folder index record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderKey {
    pub context_id: i32,
    pub user_id: i32,
    pub module: i32,
    pub account: String,
    /// `None` for module-level records
    pub folder: Option<String>,
}

impl FolderKey {
    pub fn new(
        context_id: i32,
        user_id: i32,
        module: i32,
        account: impl Into<String>,
        folder: Option<&str>,
    ) -> Self {
        Self {
            context_id,
            user_id,
            module,
            account: account.into(),
            folder: folder.map(str::to_string),
        }
    }

    pub fn scope(&self) -> FolderScope {
        FolderScope {
            context_id: self.context_id,
            user_id: self.user_id,
            module: self.module,
            account: self.account.clone(),
        }
    }

    /// Reject keys that cannot be stored. An empty folder id would collide
    /// with the module-level record of its scope.
    pub fn validate(&self) -> CoreResult<()> {
        if self.folder.as_deref() == Some("") {
            return Err(CoreError::InvalidFolderKey(self.clone()));
        }
        Ok(())
    }

    pub fn in_scope(&self, scope: &FolderScope) -> bool {
        self.context_id == scope.context_id
            && self.user_id == scope.user_id
            && self.module == scope.module
            && self.account == scope.account
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.context_id,
            self.user_id,
            self.module,
            self.account,
            self.folder.as_deref().unwrap_or("-")
        )
    }
}

/// Indexing state of one folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderIndexRecord {
    pub key: FolderKey,
    pub indexed: bool,
    pub locked: bool,
    /// Last index refresh, epoch millis
    pub timestamp: i64,
    /// When the current lock was taken, epoch millis
    pub lock_acquired: Option<i64>,
}

impl FolderIndexRecord {
    /// State of a folder that has never been touched
    pub fn fresh(key: FolderKey, now: i64) -> Self {
        Self {
            key,
            indexed: false,
            locked: false,
            timestamp: now,
            lock_acquired: None,
        }
    }

    /// Start of the current lock lease. Locks taken before leases were
    /// recorded fall back to the index timestamp.
    pub fn lease_start(&self) -> i64 {
        self.lock_acquired.unwrap_or(self.timestamp)
    }

    /// Apply a mutation, returning whether the record changed state.
    /// Conditional mutations leave the record untouched when their
    /// precondition does not hold.
    pub fn apply(&mut self, mutation: &RecordMutation) -> bool {
        match *mutation {
            RecordMutation::Indexed(indexed) => self.indexed = indexed,
            RecordMutation::Timestamp(timestamp) => self.timestamp = timestamp,
            RecordMutation::Lock { acquired_at } => {
                if self.locked {
                    return false;
                }
                self.locked = true;
                self.lock_acquired = Some(acquired_at);
            }
            RecordMutation::Unlock => {
                if !self.locked {
                    return false;
                }
                self.locked = false;
                self.lock_acquired = None;
            }
        }
        true
    }
}

/// Single-record update understood by every store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMutation {
    /// Set the indexed flag unconditionally
    Indexed(bool),
    /// Set the index timestamp unconditionally
    Timestamp(i64),
    /// Set `locked` only where it is currently clear
    Lock { acquired_at: i64 },
    /// Clear `locked` only where it is currently set
    Unlock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conditional_mutations() {
        let key = FolderKey::new(1, 1, 1, "default0", Some("INBOX"));
        let mut record = FolderIndexRecord::fresh(key, 100);

        assert!(record.apply(&RecordMutation::Lock { acquired_at: 150 }));
        assert!(record.locked);
        assert_eq!(record.lease_start(), 150);
        assert!(!record.apply(&RecordMutation::Lock { acquired_at: 200 }));
        assert_eq!(record.lock_acquired, Some(150));

        assert!(record.apply(&RecordMutation::Unlock));
        assert!(!record.apply(&RecordMutation::Unlock));
        assert_eq!(record.lock_acquired, None);
        assert_eq!(record.lease_start(), 100);
    }

    #[test]
    fn test_scope_round_trip() {
        let scope = FolderScope::new(1, 2, 3, "default0");
        let key = scope.folder("INBOX/Archive");
        assert!(key.in_scope(&scope));
        assert_eq!(key.scope(), scope);
        assert_eq!(key.to_string(), "1/2/3/default0/INBOX/Archive");
        assert_eq!(scope.module_entry().to_string(), "1/2/3/default0/-");
        assert!(!FolderKey::new(1, 2, 4, "default0", None).in_scope(&scope));
    }

    #[test]
    fn test_empty_folder_id_is_rejected() {
        let scope = FolderScope::new(1, 2, 3, "default0");
        assert!(matches!(
            scope.folder("").validate(),
            Err(CoreError::InvalidFolderKey(_))
        ));
        assert!(scope.module_entry().validate().is_ok());
        assert!(scope.folder("INBOX").validate().is_ok());
    }
}
