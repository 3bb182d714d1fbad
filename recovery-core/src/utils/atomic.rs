//! Durable write-to-temp-then-rename helper.
//!
//! Readers of a path written through [`write_atomic`] either see the previous
//! contents or the new contents, never a partial file.

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Prefix shared by every in-flight temporary file.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Atomically replace `path` with `contents`.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no parent directory for {}", path.display()),
        )
    })?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp = temp_path_for(path)?;

    let result = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    sync_dir(parent).await;
    Ok(())
}

fn temp_path_for(path: &Path) -> io::Result<PathBuf> {
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file path for atomic write: {}", path.display()),
        )
    })?;

    Ok(path.with_file_name(format!(
        "{}{}.{}.{}",
        TEMP_PREFIX,
        file_name,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )))
}

/// Remove temporary files left in `dir` by writes that never reached their rename.
pub async fn remove_temp_files(dir: &Path) -> io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
            tokio::fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Flush the directory entry so the rename itself survives a crash.
#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    let result = async { tokio::fs::File::open(dir).await?.sync_all().await }.await;
    if let Err(e) = result {
        warn!(dir = %dir.display(), error = %e, "Failed to fsync directory");
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}
