//! Single entry point wiring the ledger, catalog, orchestrator and restore
//! coordinator around one backup directory.

use crate::adapter::AdapterRegistry;
use crate::catalog::{BackupProgress, Catalog, CatalogEntry};
use crate::config::Config;
use crate::ledger::{BackupDescriptor, BlobStore, Ledger};
use crate::locks::BackupLocks;
use crate::orchestrator::BackupOrchestrator;
use crate::restore::{RestoreCoordinator, RestoreReport, VerificationReport};
use crate::utils::errors::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct BackupManager {
    catalog: Arc<Catalog>,
    orchestrator: BackupOrchestrator,
    coordinator: RestoreCoordinator,
}

fn to_names<S: AsRef<str>>(components: &[S]) -> Vec<String> {
    components.iter().map(|c| c.as_ref().to_string()).collect()
}

impl BackupManager {
    /// Open (creating if needed) the backup directory named in `config`.
    pub async fn open(config: &Config, registry: AdapterRegistry) -> Result<Self> {
        config.validate()?;

        let ledger = Ledger::new(&config.storage.backup_dir);
        ledger.init().await?;

        let registry = Arc::new(registry);
        let catalog = Arc::new(Catalog::new(ledger));
        let locks = BackupLocks::new();
        let blobs = BlobStore::new(config.storage.compression, config.storage.compression_level);

        let orchestrator =
            BackupOrchestrator::new(registry.clone(), catalog.clone(), locks.clone(), blobs)
                .with_snapshot_timeout(config.limits.snapshot_timeout())
                .with_max_concurrent_snapshots(config.limits.max_concurrent_snapshots);
        let coordinator = RestoreCoordinator::new(registry.clone(), catalog.clone(), locks)
            .with_restore_timeout(config.limits.restore_timeout());

        info!(
            backup_dir = %config.storage.backup_dir.display(),
            components = ?registry.names(),
            "Backup manager ready"
        );
        Ok(Self {
            catalog,
            orchestrator,
            coordinator,
        })
    }

    /// [`Self::open`] with default settings for `backup_dir`.
    pub async fn with_backup_dir(backup_dir: impl AsRef<Path>, registry: AdapterRegistry) -> Result<Self> {
        let mut config = Config::default();
        config.storage.backup_dir = backup_dir.as_ref().to_path_buf();
        Self::open(&config, registry).await
    }

    pub fn backup_dir(&self) -> &Path {
        self.catalog.ledger().root()
    }

    pub async fn create_backup<S: AsRef<str>>(&self, components: &[S]) -> Result<String> {
        self.orchestrator.create_backup(&to_names(components)).await
    }

    pub async fn create_backup_with_cancel<S: AsRef<str>>(
        &self,
        components: &[S],
        cancel: CancellationToken,
    ) -> Result<String> {
        self.orchestrator
            .create_backup_with_cancel(&to_names(components), cancel)
            .await
    }

    pub async fn restore_backup<S: AsRef<str>>(
        &self,
        backup_id: &str,
        components: Option<&[S]>,
    ) -> Result<bool> {
        let selected = components.map(to_names);
        self.coordinator
            .restore_backup(backup_id, selected.as_deref())
            .await
    }

    pub async fn restore_backup_detailed<S: AsRef<str>>(
        &self,
        backup_id: &str,
        components: Option<&[S]>,
    ) -> Result<RestoreReport> {
        let selected = components.map(to_names);
        self.coordinator
            .restore_backup_detailed(backup_id, selected.as_deref())
            .await
    }

    pub async fn list_backups(&self) -> Result<Vec<CatalogEntry>> {
        self.catalog.list_backups().await
    }

    pub async fn get_backup(&self, backup_id: &str) -> Result<CatalogEntry> {
        self.catalog.get(backup_id).await
    }

    /// Full ledger descriptor, including per-component results
    pub async fn describe_backup(&self, backup_id: &str) -> Result<BackupDescriptor> {
        self.catalog.descriptor(backup_id).await
    }

    pub async fn restorable_backups(&self) -> Result<Vec<CatalogEntry>> {
        self.catalog.restorable_backups().await
    }

    pub async fn verify_backup(&self, backup_id: &str) -> Result<VerificationReport> {
        self.coordinator.verify_backup(backup_id).await
    }

    pub fn progress(&self, backup_id: &str) -> Option<BackupProgress> {
        self.orchestrator.progress(backup_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{Behavior, MemoryAdapter};
    use crate::adapter::{StateStore, StateStoreAdapter};
    use crate::ledger::BackupStatus;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::TempDir;

    const NONE: Option<&[&str]> = None;

    #[tokio::test]
    async fn test_create_then_restore_example() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let state = MemoryAdapter::new(b"state-v1");
        let config = MemoryAdapter::new(b"config-v1");
        let registry = AdapterRegistry::new()
            .with("state", state.clone())?
            .with("config", config.clone())?;
        let manager = BackupManager::with_backup_dir(temp_dir.path(), registry).await?;

        let backup_id = manager.create_backup(&["state", "config"]).await?;
        assert!(backup_id.starts_with("bkp_"));

        let metadata: serde_json::Value = serde_json::from_slice(&std::fs::read(
            temp_dir.path().join(&backup_id).join("metadata.json"),
        )?)?;
        assert_eq!(metadata["components"], json!(["state", "config"]));
        assert_eq!(metadata["status"], "completed");
        assert_eq!(metadata["backup_id"], backup_id.as_str());
        assert_eq!(metadata["component_results"]["state"]["size"], 8);
        assert!(metadata["component_results"]["config"]["checksum"].is_string());

        state.set_state(b"state-v2");
        assert!(manager.restore_backup(&backup_id, NONE).await?);
        assert_eq!(state.state(), b"state-v1");

        assert!(manager.restore_backup("nope", NONE).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_catalog_lists_every_create() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = AdapterRegistry::new().with("state", MemoryAdapter::new(b"s"))?;
        let manager = BackupManager::with_backup_dir(temp_dir.path(), registry).await?;

        let mut created = Vec::new();
        for _ in 0..5 {
            created.push(manager.create_backup(&["state"]).await?);
        }

        let listed = manager.list_backups().await?;
        assert_eq!(listed.len(), 5);
        let listed_ids: HashSet<String> = listed.iter().map(|e| e.backup_id.clone()).collect();
        assert_eq!(listed_ids, created.iter().cloned().collect::<HashSet<_>>());
        assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_backup_is_kept_but_not_restorable() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = AdapterRegistry::new()
            .with("state", MemoryAdapter::new(b"s"))?
            .with("config", MemoryAdapter::failing(b"c", Behavior::FailSnapshot))?;
        let manager = BackupManager::with_backup_dir(temp_dir.path(), registry).await?;

        let good = manager.create_backup(&["state"]).await?;
        let bad = manager.create_backup(&["state", "config"]).await?;

        let entry = manager.get_backup(&bad).await?;
        assert_eq!(entry.status, BackupStatus::Failed);
        assert_eq!(entry.failed_components, vec!["config".to_string()]);

        // The captured blob stays for inspection
        let descriptor = manager.describe_backup(&bad).await?;
        assert!(descriptor.component_results["state"].checksum.is_some());
        assert!(temp_dir.path().join(&bad).join("state.blob").exists());

        let restorable: Vec<String> = manager
            .restorable_backups()
            .await?
            .into_iter()
            .map(|e| e.backup_id)
            .collect();
        assert_eq!(restorable, vec![good]);
        Ok(())
    }

    #[tokio::test]
    async fn test_catalog_survives_reopen() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let backup_id = {
            let registry = AdapterRegistry::new().with("state", MemoryAdapter::new(b"s"))?;
            let manager = BackupManager::with_backup_dir(temp_dir.path(), registry).await?;
            manager.create_backup(&["state"]).await?
        };

        let state = MemoryAdapter::new(b"changed");
        let registry = AdapterRegistry::new().with("state", state.clone())?;
        let manager = BackupManager::with_backup_dir(temp_dir.path(), registry).await?;

        assert_eq!(manager.get_backup(&backup_id).await?.status, BackupStatus::Completed);
        assert!(manager.verify_backup(&backup_id).await?.is_intact());
        assert!(manager.restore_backup(&backup_id, Some(&["state"][..])).await?);
        assert_eq!(state.state(), b"s");
        Ok(())
    }

    #[tokio::test]
    async fn test_state_store_round_trip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(StateStore::open(temp_dir.path().join("state")).await?);
        store.save_state("scheduler", &json!({"jobs": 3})).await?;

        let registry = AdapterRegistry::new()
            .with("state", Arc::new(StateStoreAdapter::new(store.clone())))?;
        let manager = BackupManager::with_backup_dir(temp_dir.path().join("backups"), registry).await?;

        let backup_id = manager.create_backup(&["state"]).await?;
        store.save_state("scheduler", &json!({"jobs": 0})).await?;

        assert!(manager.restore_backup(&backup_id, NONE).await?);
        store.clear_cache().await;
        assert_eq!(store.load_state("scheduler").await?, Some(json!({"jobs": 3})));
        Ok(())
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.backup_dir = temp_dir.path().to_path_buf();
        config.limits.max_concurrent_snapshots = 0;

        let err = BackupManager::open(&config, AdapterRegistry::new()).await.err().unwrap();
        assert!(matches!(err, crate::RecoveryError::Config(_)));
    }
}
