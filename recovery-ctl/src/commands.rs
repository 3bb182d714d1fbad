use recovery_core::restore::{BlobState, RestoreOutcome};
use recovery_core::{BackupManager, BackupStatus, CatalogEntry};
use tokio_util::sync::CancellationToken;

pub async fn create(
    manager: &BackupManager,
    components: Vec<String>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let backup_id = manager.create_backup_with_cancel(components.as_slice(), cancel).await?;
    let entry = manager.get_backup(&backup_id).await?;

    println!("{}", backup_id);
    if entry.status != BackupStatus::Completed {
        anyhow::bail!(
            "backup {} is {}: failed components {:?}",
            backup_id,
            entry.status,
            entry.failed_components
        );
    }
    Ok(())
}

pub async fn restore(
    manager: &BackupManager,
    backup_id: &str,
    components: Vec<String>,
    json: bool,
) -> anyhow::Result<()> {
    let selected = (!components.is_empty()).then_some(components);
    let report = manager
        .restore_backup_detailed(backup_id, selected.as_deref())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for component in &report.components {
            let outcome = match &component.outcome {
                RestoreOutcome::Restored => "restored".to_string(),
                RestoreOutcome::Rejected => "rejected".to_string(),
                RestoreOutcome::Failed(e) => format!("failed: {}", e),
                RestoreOutcome::Skipped => "skipped".to_string(),
            };
            println!("{:<20} {}", component.component, outcome);
        }
    }

    if !report.success() {
        anyhow::bail!("restore of {} did not complete", backup_id);
    }
    Ok(())
}

pub async fn list(manager: &BackupManager, restorable: bool, json: bool) -> anyhow::Result<()> {
    let entries = if restorable {
        manager.restorable_backups().await?
    } else {
        manager.list_backups().await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No backups found in {}", manager.backup_dir().display());
        return Ok(());
    }
    println!("{:<32} {:<12} {:<20} COMPONENTS", "BACKUP ID", "STATUS", "CREATED");
    for entry in &entries {
        print_row(entry);
    }
    Ok(())
}

fn print_row(entry: &CatalogEntry) {
    println!(
        "{:<32} {:<12} {:<20} {}",
        entry.backup_id,
        entry.status,
        entry.created_at.format("%Y-%m-%d %H:%M:%S"),
        entry.components.join(",")
    );
}

pub async fn show(manager: &BackupManager, backup_id: &str) -> anyhow::Result<()> {
    let mut descriptor = manager.describe_backup(backup_id).await?;
    // Report the effective status, not the raw ledger value
    descriptor.status = manager.get_backup(backup_id).await?.status;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}

pub async fn verify(manager: &BackupManager, backup_id: &str, json: bool) -> anyhow::Result<()> {
    let report = manager.verify_backup(backup_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{} ({})", report.backup_id, report.status);
        for (component, state) in &report.components {
            let state = match state {
                BlobState::Ok => "ok".to_string(),
                BlobState::Missing => "missing".to_string(),
                BlobState::Mismatch { expected, actual } => {
                    format!("mismatch (expected {}, found {})", expected, actual)
                }
            };
            println!("  {:<20} {}", component, state);
        }
    }

    if !report.is_intact() {
        anyhow::bail!("backup {} failed verification", backup_id);
    }
    Ok(())
}
