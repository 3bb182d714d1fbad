//! Restore coordinator: applies a completed backup, or a subset of it, back
//! onto the live components.
//!
//! Every selected blob is read and checked against its recorded checksum
//! before any adapter is called, so a corrupted backup aborts with nothing
//! applied. Adapter restores then run in recorded component order and stop at
//! the first failure; components restored before it stay applied.

use crate::adapter::{AdapterError, AdapterRegistry, ComponentAdapter};
use crate::catalog::Catalog;
use crate::ledger::{BackupDescriptor, BackupStatus, BlobStore, ComponentResult};
use crate::locks::BackupLocks;
use crate::utils::errors::{RecoveryError, Result};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_RESTORE_TIMEOUT: Duration = Duration::from_secs(300);

/// What happened to one selected component during a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RestoreOutcome {
    Restored,
    /// The adapter returned `false`
    Rejected,
    Failed(String),
    /// Not attempted because an earlier component failed
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentRestore {
    pub component: String,
    pub outcome: RestoreOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub components: Vec<ComponentRestore>,
}

impl RestoreReport {
    /// True when every selected component was restored.
    pub fn success(&self) -> bool {
        self.components
            .iter()
            .all(|c| c.outcome == RestoreOutcome::Restored)
    }

    pub fn restored(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| c.outcome == RestoreOutcome::Restored)
            .map(|c| c.component.as_str())
            .collect()
    }
}

/// Integrity state of one stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BlobState {
    Ok,
    Missing,
    Mismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub backup_id: String,
    pub status: BackupStatus,
    pub components: Vec<(String, BlobState)>,
}

impl VerificationReport {
    pub fn is_intact(&self) -> bool {
        self.components.iter().all(|(_, state)| *state == BlobState::Ok)
    }
}

pub struct RestoreCoordinator {
    registry: Arc<AdapterRegistry>,
    catalog: Arc<Catalog>,
    locks: BackupLocks,
    restore_timeout: Duration,
}

impl RestoreCoordinator {
    pub fn new(registry: Arc<AdapterRegistry>, catalog: Arc<Catalog>, locks: BackupLocks) -> Self {
        Self {
            registry,
            catalog,
            locks,
            restore_timeout: DEFAULT_RESTORE_TIMEOUT,
        }
    }

    pub fn with_restore_timeout(mut self, timeout: Duration) -> Self {
        self.restore_timeout = timeout;
        self
    }

    /// Restore `components` (all recorded components when `None`) from `backup_id`.
    ///
    /// Returns `Ok(false)` when an adapter rejected or failed its restore.
    /// Unknown ids, unrestorable backups and corrupted blobs are errors.
    pub async fn restore_backup(&self, backup_id: &str, components: Option<&[String]>) -> Result<bool> {
        Ok(self
            .restore_backup_detailed(backup_id, components)
            .await?
            .success())
    }

    /// [`Self::restore_backup`] with the per-component outcome.
    pub async fn restore_backup_detailed(
        &self,
        backup_id: &str,
        components: Option<&[String]>,
    ) -> Result<RestoreReport> {
        if !self.catalog.exists(backup_id).await {
            return Err(RecoveryError::NotFound(format!("backup {} not found", backup_id)));
        }

        let _lock = self.locks.acquire(backup_id).await;
        let descriptor = self.catalog.descriptor(backup_id).await?;
        if descriptor.status != BackupStatus::Completed {
            return Err(RecoveryError::Validation(format!(
                "backup {} is {} and cannot be restored",
                backup_id,
                self.catalog.get(backup_id).await?.status
            )));
        }

        let selected = select_components(&descriptor, components)?;
        let adapters = self.registry.resolve(&selected)?;

        info!(
            backup_id = %backup_id,
            components = ?selected,
            "Starting restore"
        );

        // Verify everything before touching any live component
        let backup_dir = self.catalog.ledger().backup_path(backup_id)?;
        let mut blobs = Vec::with_capacity(adapters.len());
        for (component, adapter) in adapters {
            let blob = read_blob(&backup_dir, &descriptor, &component).await?;
            blobs.push((component, adapter, blob));
        }

        let mut report = RestoreReport {
            backup_id: backup_id.to_string(),
            components: Vec::with_capacity(blobs.len()),
        };
        let mut aborted = false;
        for (component, adapter, blob) in blobs {
            let outcome = if aborted {
                RestoreOutcome::Skipped
            } else {
                self.apply(backup_id, &component, adapter.as_ref(), blob).await
            };
            if !matches!(outcome, RestoreOutcome::Restored | RestoreOutcome::Skipped) {
                aborted = true;
            }
            report.components.push(ComponentRestore { component, outcome });
        }

        if report.success() {
            info!(backup_id = %backup_id, "Restore completed");
        } else {
            warn!(
                backup_id = %backup_id,
                restored = ?report.restored(),
                "Restore aborted; components restored before the failure remain applied"
            );
        }
        Ok(report)
    }

    async fn apply(
        &self,
        backup_id: &str,
        component: &str,
        adapter: &dyn ComponentAdapter,
        blob: Bytes,
    ) -> RestoreOutcome {
        let result = tokio::time::timeout(self.restore_timeout, adapter.restore(blob))
            .await
            .unwrap_or_else(|_| Err(AdapterError::Timeout(self.restore_timeout)));

        match result {
            Ok(true) => {
                info!(backup_id = %backup_id, component = %component, "Component restored");
                RestoreOutcome::Restored
            }
            Ok(false) => {
                warn!(backup_id = %backup_id, component = %component, "Adapter rejected restore");
                RestoreOutcome::Rejected
            }
            Err(e) => {
                error!(
                    backup_id = %backup_id,
                    component = %component,
                    error = %e,
                    "Component restore failed"
                );
                RestoreOutcome::Failed(
                    RecoveryError::Adapter {
                        component: component.to_string(),
                        message: e.to_string(),
                    }
                    .to_string(),
                )
            }
        }
    }

    /// Check every recorded blob of `backup_id` without restoring anything.
    pub async fn verify_backup(&self, backup_id: &str) -> Result<VerificationReport> {
        let _lock = self.locks.acquire(backup_id).await;
        let descriptor = self.catalog.descriptor(backup_id).await?;
        let backup_dir = self.catalog.ledger().backup_path(backup_id)?;

        let mut components = Vec::with_capacity(descriptor.components.len());
        for component in &descriptor.components {
            let stored = descriptor
                .component_results
                .get(component)
                .filter(|result| result.is_captured())
                .and_then(|result| result.blob.as_deref());
            let present = match stored {
                Some(file_name) => tokio::fs::try_exists(backup_dir.join(file_name))
                    .await
                    .unwrap_or(false),
                None => false,
            };

            let state = if !present {
                BlobState::Missing
            } else {
                match read_blob(&backup_dir, &descriptor, component).await {
                    Ok(_) => BlobState::Ok,
                    Err(RecoveryError::Corruption { expected, actual, .. }) => {
                        BlobState::Mismatch { expected, actual }
                    }
                    Err(e) => return Err(e),
                }
            };
            components.push((component.clone(), state));
        }

        let report = VerificationReport {
            backup_id: backup_id.to_string(),
            status: self.catalog.get(backup_id).await?.status,
            components,
        };
        if !report.is_intact() {
            warn!(backup_id = %backup_id, "Backup failed verification");
        }
        Ok(report)
    }
}

/// Resolve the requested subset against what the backup recorded.
fn select_components(descriptor: &BackupDescriptor, requested: Option<&[String]>) -> Result<Vec<String>> {
    let Some(requested) = requested else {
        return Ok(descriptor.components.clone());
    };
    if requested.is_empty() {
        return Err(RecoveryError::Validation(
            "at least one component must be selected".to_string(),
        ));
    }

    let recorded: HashSet<&str> = descriptor.components.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    for name in requested {
        if !recorded.contains(name.as_str()) {
            return Err(RecoveryError::Validation(format!(
                "component '{}' is not part of backup {}",
                name, descriptor.backup_id
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(RecoveryError::Validation(format!(
                "component '{}' selected more than once",
                name
            )));
        }
    }

    // Apply in the order the backup recorded them
    Ok(descriptor
        .components
        .iter()
        .filter(|name| seen.contains(name.as_str()))
        .cloned()
        .collect())
}

async fn read_blob(backup_dir: &Path, descriptor: &BackupDescriptor, component: &str) -> Result<Bytes> {
    let missing = ComponentResult::failure("no result recorded");
    let result = descriptor.component_results.get(component).unwrap_or(&missing);
    BlobStore::read_verified(backup_dir, component, descriptor.compression, result).await
}
