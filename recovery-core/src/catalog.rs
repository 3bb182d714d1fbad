//! Backup catalog: enumerates ledger entries and reports their status.
//!
//! The catalog also tracks creates that are running in this process. A ledger
//! entry still marked `pending` is reported as `in_progress` while its create
//! is tracked here, and as `failed` once nothing is working on it any more
//! (the process died or the create was abandoned before its terminal write).

use crate::ledger::{BackupDescriptor, BackupStatus, Ledger};
use crate::utils::errors::{RecoveryError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// What the catalog reports for one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub backup_id: String,
    pub components: Vec<String>,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Components that were requested but not captured
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_components: Vec<String>,
}

impl CatalogEntry {
    fn from_descriptor(descriptor: &BackupDescriptor, in_flight: bool) -> Self {
        let status = match descriptor.status {
            BackupStatus::Pending | BackupStatus::InProgress if in_flight => BackupStatus::InProgress,
            BackupStatus::Pending | BackupStatus::InProgress => BackupStatus::Failed,
            terminal => terminal,
        };
        let failed_components = if status.is_terminal() {
            descriptor.failed_components()
        } else {
            Vec::new()
        };

        Self {
            backup_id: descriptor.backup_id.clone(),
            components: descriptor.components.clone(),
            status,
            created_at: descriptor.created_at,
            completed_at: descriptor.completed_at,
            failed_components,
        }
    }

    pub fn is_restorable(&self) -> bool {
        self.status == BackupStatus::Completed && self.failed_components.is_empty()
    }
}

/// Capture state of one component during a running create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ComponentProgress {
    Waiting,
    Running,
    Captured { size: u64 },
    Failed { error: String },
}

impl ComponentProgress {
    pub fn is_done(&self) -> bool {
        matches!(self, ComponentProgress::Captured { .. } | ComponentProgress::Failed { .. })
    }
}

/// Live view of a running create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupProgress {
    pub backup_id: String,
    pub started_at: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentProgress>,
}

impl BackupProgress {
    fn new(backup_id: &str, components: &[String]) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            started_at: Utc::now(),
            components: components
                .iter()
                .map(|name| (name.clone(), ComponentProgress::Waiting))
                .collect(),
        }
    }

    /// Components that reached a final capture state
    pub fn done(&self) -> usize {
        self.components.values().filter(|p| p.is_done()).count()
    }

    pub fn total(&self) -> usize {
        self.components.len()
    }

    pub fn percent(&self) -> f64 {
        if self.components.is_empty() {
            return 100.0;
        }
        (self.done() as f64 / self.total() as f64) * 100.0
    }
}

type InFlight = Arc<DashMap<String, BackupProgress>>;

/// Read side over the ledger plus the in-process set of running creates.
pub struct Catalog {
    ledger: Ledger,
    in_flight: InFlight,
}

/// Keeps a backup id marked as in flight until dropped.
pub struct InFlightGuard {
    backup_id: String,
    in_flight: InFlight,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.backup_id);
    }
}

impl Catalog {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Mark `backup_id` as being created by this process.
    pub fn track(&self, backup_id: &str, components: &[String]) -> InFlightGuard {
        self.in_flight
            .insert(backup_id.to_string(), BackupProgress::new(backup_id, components));
        InFlightGuard {
            backup_id: backup_id.to_string(),
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn is_in_flight(&self, backup_id: &str) -> bool {
        self.in_flight.contains_key(backup_id)
    }

    pub fn update_progress(&self, backup_id: &str, component: &str, progress: ComponentProgress) {
        if let Some(mut entry) = self.in_flight.get_mut(backup_id) {
            entry.components.insert(component.to_string(), progress);
        }
    }

    /// Progress of a create running in this process, if any
    pub fn progress(&self, backup_id: &str) -> Option<BackupProgress> {
        self.in_flight.get(backup_id).map(|entry| entry.clone())
    }

    /// Raw ledger descriptor for `backup_id`
    pub async fn descriptor(&self, backup_id: &str) -> Result<BackupDescriptor> {
        self.ledger.read(backup_id).await
    }

    pub async fn exists(&self, backup_id: &str) -> bool {
        self.ledger.exists(backup_id).await
    }

    /// Every backup in the ledger, oldest first (ties broken by id).
    ///
    /// Entries whose metadata cannot be read are logged and left out.
    pub async fn list_backups(&self) -> Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();
        for backup_id in self.ledger.ids().await? {
            match self.entry(&backup_id).await {
                Ok(entry) => entries.push(entry),
                Err(RecoveryError::NotFound(_)) => {}
                Err(e) => {
                    warn!(backup_id = %backup_id, error = %e, "Skipping unreadable backup metadata");
                }
            }
        }

        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.backup_id.cmp(&b.backup_id))
        });
        Ok(entries)
    }

    /// Catalog entry for one backup.
    pub async fn get(&self, backup_id: &str) -> Result<CatalogEntry> {
        self.entry(backup_id).await
    }

    /// In-flight membership is sampled before the read. A create writes its
    /// terminal entry before it stops being tracked, so a pending entry that
    /// is untracked on both sides of the read is only trusted after a re-read.
    async fn entry(&self, backup_id: &str) -> Result<CatalogEntry> {
        let tracked = self.is_in_flight(backup_id);
        let descriptor = self.ledger.read(backup_id).await?;
        if tracked || descriptor.status.is_terminal() {
            return Ok(CatalogEntry::from_descriptor(&descriptor, tracked));
        }
        if self.is_in_flight(backup_id) {
            return Ok(CatalogEntry::from_descriptor(&descriptor, true));
        }

        let descriptor = self.ledger.read(backup_id).await?;
        Ok(CatalogEntry::from_descriptor(&descriptor, false))
    }

    /// Completed backups with every component captured, oldest first.
    pub async fn restorable_backups(&self) -> Result<Vec<CatalogEntry>> {
        Ok(self
            .list_backups()
            .await?
            .into_iter()
            .filter(CatalogEntry::is_restorable)
            .collect())
    }
}
