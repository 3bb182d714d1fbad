//! Durable per-component JSON state with an in-memory read cache.
//!
//! Each component's state lives in `<state_dir>/<component>.json`. The
//! [`StateStoreAdapter`] snapshots the whole store as one JSON document and
//! restores it by rewriting every file, removing components absent from the
//! snapshot.

use super::{AdapterError, ComponentAdapter};
use crate::ledger::validate_segment;
use crate::utils::atomic::write_atomic;
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const STATE_EXTENSION: &str = "json";

pub struct StateStore {
    state_dir: PathBuf,
    cache: Mutex<HashMap<String, Value>>,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Create the store and its directory.
    pub async fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(state_dir);
        tokio::fs::create_dir_all(&store.state_dir).await?;
        Ok(store)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn state_path(&self, component: &str) -> Result<PathBuf> {
        validate_segment(component, "state component")?;
        Ok(self.state_dir.join(format!("{}.{}", component, STATE_EXTENSION)))
    }

    /// Persist `state` for `component`, replacing any previous value.
    pub async fn save_state(&self, component: &str, state: &Value) -> Result<()> {
        let path = self.state_path(component)?;
        let body = serde_json::to_vec_pretty(state)?;

        let mut cache = self.cache.lock().await;
        write_atomic(&path, &body).await?;
        cache.insert(component.to_string(), state.clone());
        debug!(component = %component, "State saved");
        Ok(())
    }

    /// Load the state for `component`, or `None` if nothing was saved.
    pub async fn load_state(&self, component: &str) -> Result<Option<Value>> {
        let path = self.state_path(component)?;

        let mut cache = self.cache.lock().await;
        if let Some(state) = cache.get(component) {
            return Ok(Some(state.clone()));
        }

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: Value = serde_json::from_slice(&raw)?;
        cache.insert(component.to_string(), state.clone());
        Ok(Some(state))
    }

    /// Delete the state for `component`. Returns whether anything was removed.
    pub async fn delete_state(&self, component: &str) -> Result<bool> {
        let path = self.state_path(component)?;

        let mut cache = self.cache.lock().await;
        let cached = cache.remove(component).is_some();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(cached),
            Err(e) => Err(e.into()),
        }
    }

    /// Components with saved state, sorted by name
    pub async fn list_components(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.state_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut components = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_segment(stem, "state component").is_ok() {
                    components.push(stem.to_string());
                }
            }
        }
        components.sort();
        Ok(components)
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    /// Every component's state, read from disk.
    pub async fn export(&self) -> Result<BTreeMap<String, Value>> {
        self.clear_cache().await;
        let mut states = BTreeMap::new();
        for component in self.list_components().await? {
            if let Some(state) = self.load_state(&component).await? {
                states.insert(component, state);
            }
        }
        Ok(states)
    }

    /// Make the store hold exactly `states`.
    pub async fn import(&self, states: &BTreeMap<String, Value>) -> Result<()> {
        for component in states.keys() {
            validate_segment(component, "state component")?;
        }

        for component in self.list_components().await? {
            if !states.contains_key(&component) {
                self.delete_state(&component).await?;
            }
        }
        for (component, state) in states {
            self.save_state(component, state).await?;
        }
        Ok(())
    }
}

/// Exposes a [`StateStore`] as a backable component.
#[derive(Clone)]
pub struct StateStoreAdapter {
    store: Arc<StateStore>,
}

impl StateStoreAdapter {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }
}

#[async_trait]
impl ComponentAdapter for StateStoreAdapter {
    async fn snapshot(&self) -> std::result::Result<Bytes, AdapterError> {
        let states = self
            .store
            .export()
            .await
            .map_err(|e| AdapterError::Snapshot(e.to_string()))?;
        let body = serde_json::to_vec(&states).map_err(|e| AdapterError::Snapshot(e.to_string()))?;
        info!(components = states.len(), "State store snapshot captured");
        Ok(Bytes::from(body))
    }

    async fn restore(&self, blob: Bytes) -> std::result::Result<bool, AdapterError> {
        let states: BTreeMap<String, Value> =
            serde_json::from_slice(&blob).map_err(|e| AdapterError::Malformed(e.to_string()))?;
        self.store
            .import(&states)
            .await
            .map_err(|e| AdapterError::Restore(e.to_string()))?;
        info!(components = states.len(), "State store restored");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_state() -> Value {
        json!({
            "component_a": {"status": "active", "uptime": 3600},
            "component_b": {"status": "standby", "connections": 5}
        })
    }

    #[tokio::test]
    async fn test_state_save_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = StateStore::open(temp_dir.path()).await?;

        store.save_state("test_component", &sample_state()).await?;
        assert_eq!(store.load_state("test_component").await?, Some(sample_state()));
        Ok(())
    }

    #[tokio::test]
    async fn test_state_cache_then_disk() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = StateStore::open(temp_dir.path()).await?;

        store.save_state("test_component", &sample_state()).await?;
        assert_eq!(store.load_state("test_component").await?, Some(sample_state()));

        store.clear_cache().await;
        assert_eq!(store.load_state("test_component").await?, Some(sample_state()));
        Ok(())
    }

    #[tokio::test]
    async fn test_state_deletion() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = StateStore::open(temp_dir.path()).await?;

        store.save_state("test_component", &sample_state()).await?;
        assert!(store.delete_state("test_component").await?);
        assert_eq!(store.load_state("test_component").await?, None);
        assert!(!store.delete_state("test_component").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_list_components() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = StateStore::open(temp_dir.path()).await?;

        for component in ["component_c", "component_a", "component_b"] {
            store.save_state(component, &sample_state()).await?;
        }
        std::fs::write(temp_dir.path().join("README.txt"), b"not state")?;

        assert_eq!(
            store.list_components().await?,
            vec!["component_a", "component_b", "component_c"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_state_access() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(StateStore::open(temp_dir.path()).await?);

        let mut handles = Vec::new();
        for i in 0..5 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.save_state("test_component", &json!({"index": i})).await
            }));
        }
        for handle in handles {
            handle.await.unwrap()?;
        }

        store.clear_cache().await;
        let final_state = store.load_state("test_component").await?.unwrap();
        assert!(final_state["index"].is_number());
        Ok(())
    }

    #[tokio::test]
    async fn test_adapter_round_trip_removes_new_components() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(StateStore::open(temp_dir.path()).await?);
        let adapter = StateStoreAdapter::new(store.clone());

        store.save_state("test_component", &sample_state()).await?;
        let blob = adapter.snapshot().await.unwrap();

        store.save_state("test_component", &json!({"modified": true})).await?;
        store.save_state("added_later", &json!(1)).await?;

        assert!(adapter.restore(blob).await.unwrap());
        assert_eq!(store.load_state("test_component").await?, Some(sample_state()));
        assert_eq!(store.load_state("added_later").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_adapter_rejects_malformed_payload() {
        let temp_dir = TempDir::new().unwrap();
        let adapter = StateStoreAdapter::new(Arc::new(StateStore::new(temp_dir.path())));

        let err = adapter.restore(Bytes::from_static(b"[1,2")).await.unwrap_err();
        assert!(matches!(err, AdapterError::Malformed(_)));
    }
}
