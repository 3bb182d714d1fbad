//! Backup orchestrator: drives one create from request to terminal ledger state.
//!
//! Sequence for a create:
//!
//! 1. Resolve every requested component against the registry. Nothing is
//!    written if this fails.
//! 2. Write the `pending` ledger entry.
//! 3. Snapshot each component, bounded by a semaphore. A component whose
//!    snapshot fails, times out or cannot be persisted is recorded as failed;
//!    the others still run.
//! 4. Write the terminal entry once: `completed` when every component was
//!    captured, `failed` otherwise.

use crate::adapter::{AdapterError, AdapterRegistry, ComponentAdapter};
use crate::catalog::{BackupProgress, Catalog, ComponentProgress};
use crate::ledger::{BackupDescriptor, BackupStatus, BlobStore, ComponentResult, Ledger};
use crate::locks::BackupLocks;
use crate::utils::atomic::remove_temp_files;
use crate::utils::errors::{RecoveryError, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENT_SNAPSHOTS: usize = 4;

const ID_ATTEMPTS: usize = 8;

/// `bkp_<YYYYMMDD>_<HHMMSS>_<8 hex>`
pub fn generate_backup_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("bkp_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

pub struct BackupOrchestrator {
    registry: Arc<AdapterRegistry>,
    catalog: Arc<Catalog>,
    locks: BackupLocks,
    blobs: BlobStore,
    snapshot_timeout: Duration,
    max_concurrent: usize,
}

/// Outcome of one component's capture task
struct Captured {
    component: String,
    result: ComponentResult,
    /// Storage failure that must fail the whole create
    fatal: Option<RecoveryError>,
}

impl BackupOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        catalog: Arc<Catalog>,
        locks: BackupLocks,
        blobs: BlobStore,
    ) -> Self {
        Self {
            registry,
            catalog,
            locks,
            blobs,
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
            max_concurrent: DEFAULT_MAX_CONCURRENT_SNAPSHOTS,
        }
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_snapshots(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Live progress of a create running in this process
    pub fn progress(&self, backup_id: &str) -> Option<BackupProgress> {
        self.catalog.progress(backup_id)
    }

    /// Capture `components` into a new backup and return its id.
    ///
    /// Component failures do not make this return an error: the backup is
    /// recorded as `failed` and its id is still returned. Errors are reserved
    /// for invalid requests and storage failures.
    pub async fn create_backup(&self, components: &[String]) -> Result<String> {
        self.create_backup_with_cancel(components, CancellationToken::new())
            .await
    }

    /// [`Self::create_backup`] that stops early when `cancel` fires.
    ///
    /// A cancelled create is written to the ledger as `failed` before
    /// [`RecoveryError::Cancelled`] is returned.
    pub async fn create_backup_with_cancel(
        &self,
        components: &[String],
        cancel: CancellationToken,
    ) -> Result<String> {
        let adapters = self.registry.resolve(components)?;
        let ledger = self.catalog.ledger();
        let backup_id = self.allocate_id(ledger).await?;

        let _lock = self.locks.acquire(&backup_id).await;
        let _tracking = self.catalog.track(&backup_id, components);
        let backup_dir = ledger.backup_path(&backup_id)?;

        let mut descriptor =
            BackupDescriptor::pending(&backup_id, components.to_vec(), self.blobs.compression());
        ledger.write(&backup_id, &descriptor).await?;

        let mut abandon = AbandonGuard::arm(ledger.clone(), self.locks.clone(), &descriptor);

        info!(
            backup_id = %backup_id,
            components = ?components,
            "Starting backup"
        );
        let started = std::time::Instant::now();

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        for (component, adapter) in adapters {
            abandon.tasks.spawn(capture_component(
                CaptureTask {
                    backup_id: backup_id.clone(),
                    backup_dir: backup_dir.clone(),
                    component,
                    adapter,
                    blobs: self.blobs,
                    timeout: self.snapshot_timeout,
                    catalog: self.catalog.clone(),
                },
                semaphore.clone(),
                cancel.clone(),
            ));
        }

        let mut fatal = None;
        while let Some(joined) = abandon.tasks.join_next().await {
            match joined {
                Ok(captured) => {
                    descriptor
                        .component_results
                        .insert(captured.component, captured.result);
                    if fatal.is_none() {
                        fatal = captured.fatal;
                    }
                }
                Err(e) => {
                    error!(backup_id = %backup_id, error = %e, "Capture task panicked");
                }
            }
        }

        // A token fired after every component finished does not undo the backup
        let cancelled = cancel.is_cancelled() && !descriptor.all_captured();
        if cancelled {
            descriptor.fail("cancelled");
        } else {
            // Components whose task panicked have no result
            descriptor.fill_missing("capture task aborted");
            descriptor.finalize();
        }

        if let Err(e) = ledger.write(&backup_id, &descriptor).await {
            error!(
                backup_id = %backup_id,
                error = %e,
                "Failed to write terminal ledger entry"
            );
            return Err(e);
        }
        abandon.disarm();

        let duration = started.elapsed();
        match descriptor.status {
            BackupStatus::Completed => info!(
                backup_id = %backup_id,
                duration_ms = duration.as_millis() as u64,
                "Backup completed"
            ),
            _ => warn!(
                backup_id = %backup_id,
                failed = ?descriptor.failed_components(),
                duration_ms = duration.as_millis() as u64,
                "Backup failed"
            ),
        }

        if cancelled {
            return Err(RecoveryError::Cancelled(format!("backup {} cancelled", backup_id)));
        }
        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(backup_id)
    }

    async fn allocate_id(&self, ledger: &Ledger) -> Result<String> {
        for _ in 0..ID_ATTEMPTS {
            let backup_id = generate_backup_id();
            if !ledger.exists(&backup_id).await && !self.catalog.is_in_flight(&backup_id) {
                return Ok(backup_id);
            }
        }
        Err(RecoveryError::Validation(
            "could not allocate a unique backup id".to_string(),
        ))
    }
}

struct CaptureTask {
    backup_id: String,
    backup_dir: PathBuf,
    component: String,
    adapter: Arc<dyn ComponentAdapter>,
    blobs: BlobStore,
    timeout: Duration,
    catalog: Arc<Catalog>,
}

async fn capture_component(
    task: CaptureTask,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) -> Captured {
    let CaptureTask {
        backup_id,
        backup_dir,
        component,
        adapter,
        blobs,
        timeout,
        catalog,
    } = task;

    let failed = |catalog: &Catalog, error: String, fatal: Option<RecoveryError>| {
        catalog.update_progress(
            &backup_id,
            &component,
            ComponentProgress::Failed {
                error: error.clone(),
            },
        );
        Captured {
            component: component.clone(),
            result: ComponentResult::failure(error),
            fatal,
        }
    };

    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(e) => return failed(&catalog, format!("semaphore closed: {}", e), None),
        },
        _ = cancel.cancelled() => return failed(&catalog, "cancelled".to_string(), None),
    };

    catalog.update_progress(&backup_id, &component, ComponentProgress::Running);

    let snapshot = tokio::select! {
        res = tokio::time::timeout(timeout, adapter.snapshot()) => {
            res.unwrap_or_else(|_| Err(AdapterError::Timeout(timeout)))
        }
        _ = cancel.cancelled() => return failed(&catalog, "cancelled".to_string(), None),
    };

    let data = match snapshot {
        Ok(data) => data,
        Err(e) => {
            warn!(
                backup_id = %backup_id,
                component = %component,
                error = %e,
                "Component snapshot failed"
            );
            let error = RecoveryError::Adapter {
                component: component.clone(),
                message: e.to_string(),
            };
            return failed(&catalog, error.to_string(), None);
        }
    };

    match blobs.write(&backup_dir, &component, data).await {
        Ok(stored) => {
            info!(
                backup_id = %backup_id,
                component = %component,
                size = stored.size,
                stored_size = stored.stored_size,
                "Component captured"
            );
            catalog.update_progress(
                &backup_id,
                &component,
                ComponentProgress::Captured { size: stored.size },
            );
            Captured {
                component: component.clone(),
                result: ComponentResult::success(stored),
                fatal: None,
            }
        }
        Err(e) => {
            error!(
                backup_id = %backup_id,
                component = %component,
                error = %e,
                "Failed to persist component blob"
            );
            let message = format!("failed to persist blob: {}", e);
            failed(&catalog, message, Some(e))
        }
    }
}

/// Owns the capture tasks of one create. If the create future is dropped
/// before its terminal write succeeds, the tasks are aborted and the
/// `pending` entry is finalized as failed once none of them is left running.
struct AbandonGuard {
    ledger: Ledger,
    locks: BackupLocks,
    descriptor: Option<BackupDescriptor>,
    tasks: JoinSet<Captured>,
}

impl AbandonGuard {
    fn arm(ledger: Ledger, locks: BackupLocks, descriptor: &BackupDescriptor) -> Self {
        Self {
            ledger,
            locks,
            descriptor: Some(descriptor.clone()),
            tasks: JoinSet::new(),
        }
    }

    fn disarm(&mut self) {
        self.descriptor = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some(mut descriptor) = self.descriptor.take() else {
            return;
        };
        self.tasks.abort_all();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let mut tasks = std::mem::take(&mut self.tasks);
        let ledger = self.ledger.clone();
        let locks = self.locks.clone();
        handle.spawn(async move {
            while tasks.join_next().await.is_some() {}

            let backup_id = descriptor.backup_id.clone();
            let _lock = locks.acquire(&backup_id).await;

            // Only replace an entry nobody has finalized since
            match ledger.read(&backup_id).await {
                Ok(current) if current.status.is_terminal() => return,
                Ok(current) => descriptor = current,
                Err(_) => {}
            }
            descriptor.fail("abandoned");
            if let Ok(dir) = ledger.backup_path(&backup_id) {
                if let Err(e) = remove_temp_files(&dir).await {
                    warn!(backup_id = %backup_id, error = %e, "Failed to remove temporary files");
                }
            }
            if let Err(e) = ledger.write(&backup_id, &descriptor).await {
                warn!(backup_id = %backup_id, error = %e, "Failed to finalize abandoned backup");
            } else {
                warn!(backup_id = %backup_id, "Abandoned backup marked as failed");
            }
        });
    }
}
