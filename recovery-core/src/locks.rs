//! Per-backup-id mutual exclusion.
//!
//! Creating, restoring and verifying the same backup id are serialized; work
//! on different ids never contends. Entries are dropped from the map once the
//! last holder or waiter for an id is gone.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct BackupLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one operation on one backup id.
pub struct BackupGuard {
    backup_id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl BackupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, backup_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(backup_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `backup_id`
    pub async fn acquire(&self, backup_id: &str) -> BackupGuard {
        let guard = self.slot(backup_id).lock_owned().await;
        BackupGuard {
            backup_id: backup_id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Take exclusive access only if nobody holds it right now
    pub fn try_acquire(&self, backup_id: &str) -> Option<BackupGuard> {
        let guard = self.slot(backup_id).try_lock_owned().ok()?;
        Some(BackupGuard {
            backup_id: backup_id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        })
    }

    pub fn is_locked(&self, backup_id: &str) -> bool {
        self.locks
            .get(backup_id)
            .map(|slot| slot.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of ids with a holder or waiter
    pub fn active_count(&self) -> usize {
        self.locks.len()
    }
}

impl BackupGuard {
    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Map + no other clone means no waiter is queued on this id.
        self.locks
            .remove_if(&self.backup_id, |_, slot| Arc::strong_count(slot) == 1);
    }
}
