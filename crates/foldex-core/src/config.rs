//! Coordinator and store configuration

use crate::{CoreError, CoreResult, ATTACHMENT_MODULE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration, read from a JSON file. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FoldexConfig {
    /// SQLite database holding the `indexed_folders` table
    pub database_path: PathBuf,
    /// Size of the connection pool
    pub max_connections: u32,
    /// How long a connection waits for a competing write lock
    pub busy_timeout_ms: u64,
    /// Module reported as indexed without consulting the store
    pub always_indexed_module: Option<i32>,
    /// Locks older than this are force-released by the sweeper
    pub lock_lease_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub scan_interval_secs: u64,
    /// Folders not refreshed for this long are handed out for re-indexing
    pub staleness_secs: u64,
}

impl Default for FoldexConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("foldex.db"),
            max_connections: 5,
            busy_timeout_ms: 5_000,
            always_indexed_module: Some(ATTACHMENT_MODULE),
            lock_lease_ttl_secs: 3_600,
            sweep_interval_secs: 300,
            scan_interval_secs: 600,
            staleness_secs: 86_400,
        }
    }
}

impl FoldexConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        let config: FoldexConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_connections == 0 {
            return Err(CoreError::Config("max_connections must be at least 1".into()));
        }
        for (name, value) in [
            ("lock_lease_ttl_secs", self.lock_lease_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("scan_interval_secs", self.scan_interval_secs),
        ] {
            if value == 0 {
                return Err(CoreError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn lock_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_lease_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config =
            FoldexConfig::from_json(r#"{"database_path": "/var/lib/foldex/index.db"}"#).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/foldex/index.db"));
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.always_indexed_module, Some(ATTACHMENT_MODULE));
        assert_eq!(config.lock_lease_ttl(), Duration::from_secs(3_600));
    }

    #[test]
    fn test_sentinel_can_be_disabled() {
        let config = FoldexConfig::from_json(r#"{"always_indexed_module": null}"#).unwrap();
        assert_eq!(config.always_indexed_module, None);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            FoldexConfig::from_json(r#"{"max_connections": 0}"#),
            Err(CoreError::Config(_))
        ));
        assert!(matches!(
            FoldexConfig::from_json(r#"{"sweep_interval_secs": 0}"#),
            Err(CoreError::Config(_))
        ));
        assert!(matches!(
            FoldexConfig::from_json("not json"),
            Err(CoreError::Config(_))
        ));
    }
}
