//! Component adapters: the boundary between the engine and the subsystems it backs up.
//!
//! Each backable subsystem ("state", "config", "models", ...) is represented by
//! exactly one [`ComponentAdapter`]. Adapters are registered by name in an
//! [`AdapterRegistry`] at process start; the orchestrator and the restore
//! coordinator receive the registry by shared ownership and never construct
//! adapters themselves.

pub mod directory;
pub mod state_store;

use crate::ledger::validate_segment;
use crate::utils::errors::{RecoveryError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

pub use directory::DirectoryAdapter;
pub use state_store::{StateStore, StateStoreAdapter};

/// Failure reported by an adapter's snapshot or restore call.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("restore failed: {0}")]
    Restore(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot/restore contract implemented once per backable component.
#[async_trait]
pub trait ComponentAdapter: Send + Sync {
    /// Capture the component's current state as an opaque payload.
    async fn snapshot(&self) -> std::result::Result<Bytes, AdapterError>;

    /// Apply a payload previously produced by [`ComponentAdapter::snapshot`].
    ///
    /// `Ok(false)` means the adapter declined the payload without raising.
    async fn restore(&self, blob: Bytes) -> std::result::Result<bool, AdapterError>;
}

/// Name → adapter mapping, resolved once at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn ComponentAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under `name`. Names are unique and must be usable as file names.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        adapter: Arc<dyn ComponentAdapter>,
    ) -> Result<()> {
        let name = name.into();
        validate_segment(&name, "component name")?;
        if self.adapters.contains_key(&name) {
            return Err(RecoveryError::Validation(format!(
                "component '{}' is already registered",
                name
            )));
        }
        self.adapters.insert(name, adapter);
        Ok(())
    }

    /// Builder-style [`AdapterRegistry::register`].
    pub fn with(mut self, name: impl Into<String>, adapter: Arc<dyn ComponentAdapter>) -> Result<Self> {
        self.register(name, adapter)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ComponentAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registered component names in lexical order
    pub fn names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolve an ordered, non-empty list of distinct names to their adapters.
    ///
    /// Fails with a validation error on an empty list, a duplicate, or an
    /// unregistered name. Input order is preserved.
    pub fn resolve(&self, components: &[String]) -> Result<Vec<(String, Arc<dyn ComponentAdapter>)>> {
        if components.is_empty() {
            return Err(RecoveryError::Validation(
                "at least one component must be requested".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(components.len());
        let mut resolved = Vec::with_capacity(components.len());
        for name in components {
            if !seen.insert(name.as_str()) {
                return Err(RecoveryError::Validation(format!(
                    "component '{}' was requested more than once",
                    name
                )));
            }
            let adapter = self.get(name).ok_or_else(|| {
                RecoveryError::Validation(format!("unknown component: {}", name))
            })?;
            resolved.push((name.clone(), adapter));
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("components", &self.names())
            .finish()
    }
}
