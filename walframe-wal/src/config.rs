//! WAL configuration.
//!
//! Configuration is resolved in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML file named by `WALFRAME_CONFIG` (or passed to [`WalConfig::from_file`])
//! 3. Environment variables

use crate::checksum::ByteOrder;
use crate::error::WalError;
use crate::frame::encode_page_size;
use crate::DEFAULT_PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// When the log file is synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Sync after every frame (safest, slowest).
    EveryFrame,
    /// Sync when a commit frame is written.
    #[default]
    OnCommit,
    /// Sync after every N commits.
    EveryN(u32),
    /// Never sync automatically (caller must call sync).
    Never,
}

impl FromStr for FsyncPolicy {
    type Err = WalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "every_frame" | "everyframe" => Ok(FsyncPolicy::EveryFrame),
            "on_commit" | "oncommit" => Ok(FsyncPolicy::OnCommit),
            "never" => Ok(FsyncPolicy::Never),
            s if s.starts_with("every_n:") => s[8..]
                .parse()
                .map(FsyncPolicy::EveryN)
                .map_err(|e| WalError::Config(format!("bad fsync interval {s:?}: {e}"))),
            other => Err(WalError::Config(format!("unknown fsync policy {other:?}"))),
        }
    }
}

/// WAL configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Path of the log file.
    pub path: PathBuf,
    /// Database page size in bytes.
    pub page_size: u32,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
    /// Checksum word order for new generations.
    pub checksum_order: ByteOrder,
    /// Size the log is truncated back to after a restart, if set.
    pub max_wal_size: Option<u64>,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/db-wal"),
            page_size: DEFAULT_PAGE_SIZE,
            fsync_policy: FsyncPolicy::default(),
            checksum_order: ByteOrder::native(),
            max_wal_size: None,
        }
    }
}

impl WalConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }

    pub fn with_checksum_order(mut self, order: ByteOrder) -> Self {
        self.checksum_order = order;
        self
    }

    pub fn with_max_wal_size(mut self, bytes: u64) -> Self {
        self.max_wal_size = Some(bytes);
        self
    }

    /// Loads configuration from `WALFRAME_CONFIG` if set, then applies
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self, WalError> {
        let mut config = match std::env::var("WALFRAME_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| WalError::Config(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| WalError::Config(format!("{}: {e}", path.display())))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WalError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| WalError::Config(format!("{}: {e}", path.display())))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("WALFRAME_PATH") {
            self.path = PathBuf::from(path);
        }

        if let Ok(size) = std::env::var("WALFRAME_PAGE_SIZE") {
            if let Ok(size) = size.parse() {
                self.page_size = size;
            }
        }

        if let Ok(policy) = std::env::var("WALFRAME_FSYNC") {
            match policy.parse() {
                Ok(policy) => self.fsync_policy = policy,
                Err(e) => tracing::warn!("ignoring WALFRAME_FSYNC: {}", e),
            }
        }

        if let Ok(max) = std::env::var("WALFRAME_MAX_WAL_SIZE") {
            if let Ok(bytes) = max.parse() {
                self.max_wal_size = Some(bytes);
            }
        }
    }

    /// Checks that the configuration describes a usable log.
    pub fn validate(&self) -> Result<(), WalError> {
        encode_page_size(self.page_size)?;
        if self.fsync_policy == FsyncPolicy::EveryN(0) {
            return Err(WalError::Config("fsync interval must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = WalConfig::default();
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.fsync_policy, FsyncPolicy::OnCommit);
        assert_eq!(config.checksum_order, ByteOrder::native());
        assert!(config.max_wal_size.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let config = WalConfig::new("/tmp/x-wal")
            .with_page_size(1024)
            .with_fsync_policy(FsyncPolicy::EveryN(8))
            .with_checksum_order(ByteOrder::Big)
            .with_max_wal_size(1 << 20);
        assert_eq!(config.path, PathBuf::from("/tmp/x-wal"));
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.fsync_policy, FsyncPolicy::EveryN(8));
        assert_eq!(config.checksum_order, ByteOrder::Big);
        assert_eq!(config.max_wal_size, Some(1 << 20));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(WalConfig::default().with_page_size(1000).validate().is_err());
        assert!(WalConfig::default().with_page_size(128).validate().is_err());
        assert!(WalConfig::default()
            .with_fsync_policy(FsyncPolicy::EveryN(0))
            .validate()
            .is_err());
        WalConfig::default().with_page_size(65536).validate().unwrap();
    }

    #[test]
    fn test_fsync_policy_from_str() {
        assert_eq!("every_frame".parse::<FsyncPolicy>().unwrap(), FsyncPolicy::EveryFrame);
        assert_eq!("ON_COMMIT".parse::<FsyncPolicy>().unwrap(), FsyncPolicy::OnCommit);
        assert_eq!("never".parse::<FsyncPolicy>().unwrap(), FsyncPolicy::Never);
        assert_eq!("every_n:16".parse::<FsyncPolicy>().unwrap(), FsyncPolicy::EveryN(16));
        assert!("every_n:lots".parse::<FsyncPolicy>().is_err());
        assert!("sometimes".parse::<FsyncPolicy>().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "path: /var/lib/app/main-wal\npage_size: 8192\nfsync_policy: never\nchecksum_order: big"
        )
        .unwrap();

        let config = WalConfig::from_file(file.path()).unwrap();
        assert_eq!(config.path, PathBuf::from("/var/lib/app/main-wal"));
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.fsync_policy, FsyncPolicy::Never);
        assert_eq!(config.checksum_order, ByteOrder::Big);
        assert!(config.max_wal_size.is_none());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.yaml");
        let config = WalConfig::new("db-wal")
            .with_fsync_policy(FsyncPolicy::EveryN(4))
            .with_max_wal_size(4096);

        config.save(&path).unwrap();
        assert_eq!(WalConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = WalConfig::from_file("/nonexistent/walframe.yaml").unwrap_err();
        assert!(matches!(err, WalError::Config(_)));
    }
}
