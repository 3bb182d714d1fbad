//! Metadata ledger: the durable descriptor of one backup.
//!
//! Layout, one directory per backup:
//!
//! ```text
//! <backup_dir>/<backup_id>/metadata.json
//! <backup_dir>/<backup_id>/<component>.blob
//! ```
//!
//! `metadata.json` is always replaced through [`write_atomic`], so a reader
//! never observes a half-written descriptor.

pub mod blob;

use crate::config::Compression;
use crate::utils::atomic::{write_atomic, TEMP_PREFIX};
use crate::utils::errors::{RecoveryError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use blob::{checksum, BlobStore, StoredBlob};

/// File name of the descriptor inside a backup directory.
pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentOutcome {
    Success,
    Failed,
}

/// Per-component record of what was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentResult {
    pub outcome: ComponentOutcome,

    /// Blob file name, relative to the backup directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,

    /// Lowercase hex SHA-256 of the uncompressed payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Uncompressed payload length in bytes
    #[serde(default)]
    pub size: u64,

    /// Length of the blob file on disk
    #[serde(default)]
    pub stored_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentResult {
    pub fn success(stored: StoredBlob) -> Self {
        Self {
            outcome: ComponentOutcome::Success,
            blob: Some(stored.file_name),
            checksum: Some(stored.checksum),
            size: stored.size,
            stored_size: stored.stored_size,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            outcome: ComponentOutcome::Failed,
            blob: None,
            checksum: None,
            size: 0,
            stored_size: 0,
            error: Some(error.into()),
        }
    }

    /// Captured successfully, with a blob and checksum to restore from.
    pub fn is_captured(&self) -> bool {
        self.outcome == ComponentOutcome::Success && self.blob.is_some() && self.checksum.is_some()
    }
}

/// Self-describing record of one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub backup_id: String,

    /// Requested components, in request order
    pub components: Vec<String>,

    pub status: BackupStatus,

    #[serde(alias = "timestamp", deserialize_with = "de_timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default = "legacy_compression")]
    pub compression: Compression,

    #[serde(default)]
    pub component_results: BTreeMap<String, ComponentResult>,
}

fn legacy_compression() -> Compression {
    Compression::None
}

impl BackupDescriptor {
    /// A fresh `pending` descriptor with no component results.
    pub fn pending(backup_id: &str, components: Vec<String>, compression: Compression) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            components,
            status: BackupStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            compression,
            component_results: BTreeMap::new(),
        }
    }

    /// True when every requested component was captured with a blob.
    pub fn all_captured(&self) -> bool {
        self.components.iter().all(|name| {
            self.component_results
                .get(name)
                .map(ComponentResult::is_captured)
                .unwrap_or(false)
        })
    }

    /// Move to the terminal status implied by the component results.
    ///
    /// `completed` iff every requested component was captured; anything else is `failed`.
    pub fn finalize(&mut self) {
        self.status = if self.all_captured() {
            BackupStatus::Completed
        } else {
            BackupStatus::Failed
        };
        self.completed_at = Some(Utc::now());
    }

    /// Record `reason` as the failure of every component that has no result yet.
    pub fn fill_missing(&mut self, reason: &str) {
        for name in &self.components {
            self.component_results
                .entry(name.clone())
                .or_insert_with(|| ComponentResult::failure(reason));
        }
    }

    /// Force the terminal `failed` status, recording `reason` against every
    /// component that has no result yet.
    pub fn fail(&mut self, reason: &str) {
        self.fill_missing(reason);
        self.status = BackupStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_restorable(&self) -> bool {
        self.status == BackupStatus::Completed && self.all_captured()
    }

    /// Components that did not capture successfully
    pub fn failed_components(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|name| {
                !self
                    .component_results
                    .get(*name)
                    .map(ComponentResult::is_captured)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// Accepts RFC 3339 and the offset-less ISO 8601 form older metadata files carry.
fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

fn de_timestamp<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn de_opt_timestamp<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(d)? {
        Some(raw) => parse_timestamp(&raw).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Reject ids and component names that are not a single, plain path segment.
pub fn validate_segment(value: &str, what: &str) -> Result<()> {
    let bad = value.is_empty()
        || value.len() > 200
        || value.starts_with('.')
        || value.contains(['/', '\\', '\0'])
        || value.chars().any(char::is_control);
    if bad {
        return Err(RecoveryError::Validation(format!("invalid {}: {:?}", what, value)));
    }
    Ok(())
}

/// Durable store of backup descriptors.
#[derive(Debug, Clone)]
pub struct Ledger {
    root: PathBuf,
}

impl Ledger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory if needed.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory scoped to one backup
    pub fn backup_path(&self, backup_id: &str) -> Result<PathBuf> {
        validate_segment(backup_id, "backup id")?;
        Ok(self.root.join(backup_id))
    }

    pub fn metadata_path(&self, backup_id: &str) -> Result<PathBuf> {
        Ok(self.backup_path(backup_id)?.join(METADATA_FILE))
    }

    /// Atomically persist `descriptor` as the ledger entry for `backup_id`.
    pub async fn write(&self, backup_id: &str, descriptor: &BackupDescriptor) -> Result<()> {
        if descriptor.backup_id != backup_id {
            return Err(RecoveryError::Validation(format!(
                "descriptor for '{}' cannot be written under '{}'",
                descriptor.backup_id, backup_id
            )));
        }
        let path = self.metadata_path(backup_id)?;
        let body = serde_json::to_vec_pretty(descriptor)?;
        write_atomic(&path, &body).await?;
        debug!(backup_id = %backup_id, status = %descriptor.status, "Ledger entry written");
        Ok(())
    }

    /// Read the descriptor for `backup_id`.
    pub async fn read(&self, backup_id: &str) -> Result<BackupDescriptor> {
        let path = match self.metadata_path(backup_id) {
            Ok(path) => path,
            Err(_) => return Err(RecoveryError::NotFound(format!("backup {} not found", backup_id))),
        };
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RecoveryError::NotFound(format!("backup {} not found", backup_id)));
            }
            Err(e) => return Err(e.into()),
        };
        let descriptor: BackupDescriptor = serde_json::from_slice(&raw)?;
        if descriptor.backup_id != backup_id {
            return Err(RecoveryError::Validation(format!(
                "ledger at {} describes backup '{}'",
                path.display(),
                descriptor.backup_id
            )));
        }
        Ok(descriptor)
    }

    pub async fn exists(&self, backup_id: &str) -> bool {
        match self.metadata_path(backup_id) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Ids of every directory under the root that holds a descriptor file.
    pub async fn ids(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if tokio::fs::try_exists(entry.path().join(METADATA_FILE)).await.unwrap_or(false) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn stored(name: &str) -> StoredBlob {
        StoredBlob {
            file_name: format!("{}.blob", name),
            checksum: checksum(name.as_bytes()),
            size: name.len() as u64,
            stored_size: name.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_write_read_exists() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let ledger = Ledger::new(temp_dir.path());

        let descriptor = BackupDescriptor::pending("bkp_1", names(&["state", "config"]), Compression::Zstd);
        assert!(!ledger.exists("bkp_1").await);

        ledger.write("bkp_1", &descriptor).await?;

        assert!(ledger.exists("bkp_1").await);
        let read = ledger.read("bkp_1").await?;
        assert_eq!(read, descriptor);
        assert_eq!(read.components, names(&["state", "config"]));
        assert_eq!(read.status, BackupStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_unknown_is_not_found() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let ledger = Ledger::new(temp_dir.path());

        assert!(ledger.read("missing").await.unwrap_err().is_not_found());
        assert!(ledger.read("../escape").await.unwrap_err().is_not_found());
        assert!(!ledger.exists("../escape").await);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_rejects_mismatched_id() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let ledger = Ledger::new(temp_dir.path());
        let descriptor = BackupDescriptor::pending("bkp_a", names(&["state"]), Compression::None);

        assert!(ledger.write("bkp_b", &descriptor).await.unwrap_err().is_validation());
        Ok(())
    }

    #[tokio::test]
    async fn test_ids_skip_dirs_without_metadata() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let ledger = Ledger::new(temp_dir.path());

        for id in ["bkp_b", "bkp_a"] {
            let descriptor = BackupDescriptor::pending(id, names(&["state"]), Compression::None);
            ledger.write(id, &descriptor).await?;
        }
        std::fs::create_dir(temp_dir.path().join("stray"))?;
        std::fs::write(temp_dir.path().join("notes.txt"), b"x")?;

        assert_eq!(ledger.ids().await?, names(&["bkp_a", "bkp_b"]));
        Ok(())
    }

    #[test]
    fn test_finalize_completed_only_when_all_captured() {
        let mut descriptor = BackupDescriptor::pending("b", names(&["state", "config"]), Compression::None);
        descriptor
            .component_results
            .insert("state".to_string(), ComponentResult::success(stored("state")));
        descriptor
            .component_results
            .insert("config".to_string(), ComponentResult::failure("boom"));

        descriptor.finalize();
        assert_eq!(descriptor.status, BackupStatus::Failed);
        assert!(descriptor.completed_at.is_some());
        assert!(!descriptor.is_restorable());
        assert_eq!(descriptor.failed_components(), names(&["config"]));

        descriptor
            .component_results
            .insert("config".to_string(), ComponentResult::success(stored("config")));
        descriptor.finalize();
        assert_eq!(descriptor.status, BackupStatus::Completed);
        assert!(descriptor.is_restorable());
    }

    #[test]
    fn test_fail_fills_missing_results() {
        let mut descriptor = BackupDescriptor::pending("b", names(&["state", "config"]), Compression::None);
        descriptor
            .component_results
            .insert("state".to_string(), ComponentResult::success(stored("state")));

        descriptor.fail("cancelled");

        assert_eq!(descriptor.status, BackupStatus::Failed);
        assert!(descriptor.component_results["state"].is_captured());
        assert_eq!(descriptor.component_results["config"].error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_metadata_field_names() {
        let descriptor = BackupDescriptor::pending("bkp_x", names(&["state"]), Compression::Zstd);
        let json = serde_json::to_value(&descriptor).unwrap();

        assert_eq!(json["backup_id"], "bkp_x");
        assert_eq!(json["components"], serde_json::json!(["state"]));
        assert_eq!(json["status"], "pending");
        assert_eq!(json["compression"], "zstd");
        assert!(json["completed_at"].is_null());
        assert!(json["created_at"].is_string());
    }

    #[test]
    fn test_reads_legacy_metadata() {
        let legacy = r#"{
            "backup_id": "20231215_101500",
            "timestamp": "2023-12-15T10:15:00.123456",
            "components": ["state", "config"],
            "status": "completed"
        }"#;

        let descriptor: BackupDescriptor = serde_json::from_str(legacy).unwrap();
        assert_eq!(descriptor.status, BackupStatus::Completed);
        assert_eq!(descriptor.compression, Compression::None);
        assert!(descriptor.component_results.is_empty());
        assert_eq!(descriptor.created_at.format("%Y%m%d").to_string(), "20231215");
        assert!(!descriptor.is_restorable());
    }

    #[test]
    fn test_validate_segment() {
        assert!(validate_segment("bkp_20231215_101500_aa11bb22", "id").is_ok());
        assert!(validate_segment("models", "id").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", ".hidden"] {
            assert!(validate_segment(bad, "id").is_err(), "{bad:?} accepted");
        }
    }
}
