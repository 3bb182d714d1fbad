use recovery_core::adapter::{DirectoryAdapter, StateStore, StateStoreAdapter};
use recovery_core::config::{ComponentConfig, ComponentKind};
use recovery_core::{AdapterRegistry, ComponentAdapter};
use std::sync::Arc;

/// Build the adapter registry from the configured components.
pub async fn build_registry(components: &[ComponentConfig]) -> anyhow::Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();

    for component in components {
        let adapter: Arc<dyn ComponentAdapter> = match component.kind {
            ComponentKind::Directory => Arc::new(
                DirectoryAdapter::new(&component.path).with_excludes(component.exclude.clone()),
            ),
            ComponentKind::StateStore => {
                let store = StateStore::open(&component.path).await?;
                Arc::new(StateStoreAdapter::new(Arc::new(store)))
            }
        };
        registry.register(component.name.clone(), adapter)?;
        tracing::debug!(
            component = %component.name,
            kind = ?component.kind,
            path = %component.path.display(),
            "Registered component"
        );
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn component(name: &str, kind: ComponentKind, path: PathBuf) -> ComponentConfig {
        ComponentConfig {
            name: name.to_string(),
            kind,
            path,
            exclude: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_build_registry() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let registry = build_registry(&[
            component("state", ComponentKind::StateStore, temp_dir.path().join("state")),
            component("models", ComponentKind::Directory, temp_dir.path().join("models")),
        ])
        .await?;

        assert_eq!(registry.names(), vec!["models".to_string(), "state".to_string()]);
        // State stores create their directory on open
        assert!(temp_dir.path().join("state").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_component_name_is_rejected() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let result = build_registry(&[component(
            "../escape",
            ComponentKind::Directory,
            temp_dir.path().to_path_buf(),
        )])
        .await;
        assert!(result.is_err());
        Ok(())
    }
}
