//! Configuration management for the recovery engine.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or none at all) is valid.

use crate::utils::errors::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Component adapters to register at startup
    #[serde(default)]
    pub components: Vec<ComponentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one sub-directory per backup
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Blob compression algorithm
    #[serde(default)]
    pub compression: Compression,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Zstd,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound for a single adapter snapshot call
    #[serde(default = "default_timeout_secs")]
    pub snapshot_timeout_secs: u64,

    /// Upper bound for a single adapter restore call
    #[serde(default = "default_timeout_secs")]
    pub restore_timeout_secs: u64,

    /// Maximum adapters snapshotting at the same time
    #[serde(default = "default_max_concurrent_snapshots")]
    pub max_concurrent_snapshots: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Name callers use in `create_backup`/`restore_backup`
    pub name: String,

    pub kind: ComponentKind,

    /// Directory the adapter snapshots from and restores into
    pub path: PathBuf,

    /// File name fragments skipped by directory adapters
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Directory,
    StateStore,
}

// Default values
fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_compression_level() -> i32 {
    3
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_snapshots() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            compression: Compression::default(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            snapshot_timeout_secs: default_timeout_secs(),
            restore_timeout_secs: default_timeout_secs(),
            max_concurrent_snapshots: default_max_concurrent_snapshots(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            log: LogConfig::default(),
            components: Vec::new(),
        }
    }
}

impl LimitsConfig {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.restore_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| RecoveryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would produce an ambiguous adapter registry
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_snapshots == 0 {
            return Err(RecoveryError::Config(
                "limits.max_concurrent_snapshots must be at least 1".to_string(),
            ));
        }
        if self.storage.compression == Compression::Zstd
            && !(1..=22).contains(&self.storage.compression_level)
        {
            return Err(RecoveryError::Config(format!(
                "storage.compression_level {} is outside 1..=22",
                self.storage.compression_level
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for component in &self.components {
            if component.name.trim().is_empty() {
                return Err(RecoveryError::Config("component name must not be empty".to_string()));
            }
            if !seen.insert(component.name.as_str()) {
                return Err(RecoveryError::Config(format!(
                    "component '{}' is configured more than once",
                    component.name
                )));
            }
        }
        Ok(())
    }
}
