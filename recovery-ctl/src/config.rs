use recovery_core::Config;
use std::path::{Path, PathBuf};

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

/// Load the config file (if any), resolve its relative paths and apply overrides.
pub fn load(overrides: &Overrides) -> anyhow::Result<Config> {
    let mut config = match &overrides.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            resolve_paths(&mut config, base);
            config
        }
        None => Config::default(),
    };

    if let Some(dir) = &overrides.backup_dir {
        config.storage.backup_dir = dir.clone();
    }
    if let Some(level) = &overrides.log_level {
        config.log.level = level.clone();
    }
    Ok(config)
}

/// Paths in a config file are relative to the file, not the working directory.
fn resolve_paths(config: &mut Config, base: &Path) {
    let resolve = |path: &Path| {
        if path.is_relative() {
            base.join(path)
        } else {
            path.to_path_buf()
        }
    };

    config.storage.backup_dir = resolve(&config.storage.backup_dir);
    for component in &mut config.components {
        component.path = resolve(&component.path);
    }
}
