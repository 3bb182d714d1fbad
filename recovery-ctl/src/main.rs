//! recovery-ctl - command-line front end for recovery-core.

mod commands;
mod config;
mod registry;

use clap::{Parser, Subcommand};
use recovery_core::{utils, BackupManager};
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "RECOVERY_CONFIG")]
    config: Option<PathBuf>,

    /// Backup directory (overrides config)
    #[arg(short, long, value_name = "DIR", env = "RECOVERY_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture a new backup (all configured components by default)
    Create {
        components: Vec<String>,
    },

    /// Restore a backup, or only the given components of it
    Restore {
        backup_id: String,

        #[arg(short = 'C', long = "component")]
        components: Vec<String>,

        #[arg(long)]
        json: bool,
    },

    /// List backups, oldest first
    List {
        /// Only completed backups
        #[arg(long)]
        restorable: bool,

        #[arg(long)]
        json: bool,
    },

    /// Print the full metadata of one backup
    Show { backup_id: String },

    /// Check stored blobs against their checksums
    Verify {
        backup_id: String,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let config = config::load(&config::Overrides {
        config: args.config.clone(),
        backup_dir: args.backup_dir.clone(),
        log_level: args.log_level.clone(),
    })?;
    utils::logger::init(&config.log.level)?;

    tracing::debug!(
        "Starting recovery-ctl v{} (backup_dir: {})",
        env!("CARGO_PKG_VERSION"),
        config.storage.backup_dir.display()
    );

    let registry = registry::build_registry(&config.components).await?;
    let manager = BackupManager::open(&config, registry).await?;

    match args.command {
        Command::Create { components } => {
            let components = if components.is_empty() {
                config.components.iter().map(|c| c.name.clone()).collect()
            } else {
                components
            };

            let cancel = CancellationToken::new();
            let watcher = tokio::spawn(shutdown_signal(cancel.clone()));
            let result = commands::create(&manager, components, cancel).await;
            watcher.abort();
            result
        }
        Command::Restore {
            backup_id,
            components,
            json,
        } => commands::restore(&manager, &backup_id, components, json).await,
        Command::List { restorable, json } => commands::list(&manager, restorable, json).await,
        Command::Show { backup_id } => commands::show(&manager, &backup_id).await,
        Command::Verify { backup_id, json } => commands::verify(&manager, &backup_id, json).await,
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::warn!("Received SIGINT, cancelling"),
        _ = terminate => tracing::warn!("Received SIGTERM, cancelling"),
    }

    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_restore_subset() {
        let args = Args::try_parse_from([
            "recovery-ctl",
            "--backup-dir",
            "/tmp/backups",
            "restore",
            "bkp_20240101_000000_aa11bb22",
            "-C",
            "state",
            "--component",
            "config",
        ])
        .unwrap();

        assert_eq!(args.backup_dir, Some(PathBuf::from("/tmp/backups")));
        match args.command {
            Command::Restore {
                backup_id,
                components,
                json,
            } => {
                assert_eq!(backup_id, "bkp_20240101_000000_aa11bb22");
                assert_eq!(components, vec!["state", "config"]);
                assert!(!json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_create_without_components() {
        let args = Args::try_parse_from(["recovery-ctl", "create"]).unwrap();
        assert!(matches!(args.command, Command::Create { components } if components.is_empty()));
    }
}
