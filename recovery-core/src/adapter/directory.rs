//! Adapter that snapshots a directory tree into a single archive blob.
//!
//! Archive layout (all integers big-endian):
//!
//! ```text
//! "RCAR" | version: u8 | entries: u32
//! entry := path_len: u32 | path: utf-8 | mode: u32 | data_len: u64 | data
//! ```
//!
//! Restore unpacks into a staging directory next to the target and then swaps
//! it into place, so a failed restore leaves the previous tree untouched.

use super::{AdapterError, ComponentAdapter};
use crate::fs::metadata::{apply_mode, read_mode};
use crate::fs::walker::{calculate_total_size, walk_directory, WalkOptions};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

const MAGIC: &[u8; 4] = b"RCAR";
const VERSION: u8 = 1;

/// One file inside an archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub mode: u32,
    pub data: Bytes,
}

/// Snapshots and restores every regular file under `root`.
#[derive(Debug, Clone)]
pub struct DirectoryAdapter {
    root: PathBuf,
    options: WalkOptions,
}

impl DirectoryAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            options: WalkOptions::default(),
        }
    }

    pub fn with_excludes(mut self, patterns: Vec<String>) -> Self {
        self.options = self.options.with_excludes(patterns);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ComponentAdapter for DirectoryAdapter {
    async fn snapshot(&self) -> Result<Bytes, AdapterError> {
        let root = self.root.clone();
        let options = self.options.clone();
        tokio::task::spawn_blocking(move || pack_directory(&root, &options))
            .await
            .map_err(|e| AdapterError::Snapshot(format!("snapshot task failed: {}", e)))?
    }

    async fn restore(&self, blob: Bytes) -> Result<bool, AdapterError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<bool, AdapterError> {
            let entries = decode_archive(blob)?;
            replace_directory(&root, &entries)?;
            Ok(true)
        })
        .await
        .map_err(|e| AdapterError::Restore(format!("restore task failed: {}", e)))?
    }
}

/// Read every file under `root` into an archive.
pub fn pack_directory(root: &Path, options: &WalkOptions) -> Result<Bytes, AdapterError> {
    if !root.is_dir() {
        return Err(AdapterError::Snapshot(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let files = walk_directory(root, options)?;
    let mut entries = Vec::with_capacity(files.len());
    for file in &files {
        let path = file
            .relative_path
            .to_str()
            .ok_or_else(|| {
                AdapterError::Snapshot(format!("non UTF-8 path: {}", file.relative_path.display()))
            })?
            .replace('\\', "/");
        entries.push(ArchiveEntry {
            path,
            mode: read_mode(&file.path)?,
            data: Bytes::from(std::fs::read(&file.path)?),
        });
    }

    info!(
        root = %root.display(),
        files = files.len(),
        bytes = calculate_total_size(&files),
        "Directory snapshot captured"
    );
    Ok(encode_archive(&entries))
}

pub fn encode_archive(entries: &[ArchiveEntry]) -> Bytes {
    let payload: usize = entries.iter().map(|e| 16 + e.path.len() + e.data.len()).sum();
    let mut buf = BytesMut::with_capacity(9 + payload);

    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u32(entries.len() as u32);
    for entry in entries {
        buf.put_u32(entry.path.len() as u32);
        buf.put_slice(entry.path.as_bytes());
        buf.put_u32(entry.mode);
        buf.put_u64(entry.data.len() as u64);
        buf.put_slice(&entry.data);
    }
    buf.freeze()
}

pub fn decode_archive(mut buf: Bytes) -> Result<Vec<ArchiveEntry>, AdapterError> {
    let malformed = |what: &str| AdapterError::Malformed(format!("directory archive: {}", what));

    if buf.remaining() < 9 || &buf[..4] != MAGIC {
        return Err(malformed("bad header"));
    }
    buf.advance(4);
    let version = buf.get_u8();
    if version != VERSION {
        return Err(malformed(&format!("unsupported version {}", version)));
    }
    let count = buf.get_u32() as usize;

    let mut entries = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        if buf.remaining() < 4 {
            return Err(malformed("truncated entry header"));
        }
        let path_len = buf.get_u32() as usize;
        if buf.remaining() < path_len + 12 {
            return Err(malformed("truncated path"));
        }
        let path = String::from_utf8(buf.split_to(path_len).to_vec())
            .map_err(|_| malformed("path is not UTF-8"))?;
        if !is_safe_relative(&path) {
            return Err(malformed(&format!("unsafe path {:?}", path)));
        }
        let mode = buf.get_u32();
        let data_len = buf.get_u64() as usize;
        if buf.remaining() < data_len {
            return Err(malformed("truncated file data"));
        }
        let data = buf.split_to(data_len);
        entries.push(ArchiveEntry { path, mode, data });
    }

    if buf.has_remaining() {
        return Err(malformed("trailing bytes"));
    }
    Ok(entries)
}

fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Unpack `entries` into a sibling staging directory and swap it in for `root`.
fn replace_directory(root: &Path, entries: &[ArchiveEntry]) -> Result<(), AdapterError> {
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AdapterError::Restore(format!("invalid restore target {}", root.display())))?;
    let parent = root.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let token = uuid::Uuid::new_v4().simple().to_string();
    let staging = parent.join(format!(".{}.restore-{}", name, token));
    let retired = parent.join(format!(".{}.old-{}", name, token));

    if let Err(e) = unpack_into(&staging, entries) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let had_previous = root.exists();
    if had_previous {
        std::fs::rename(root, &retired)?;
    }
    if let Err(e) = std::fs::rename(&staging, root) {
        if had_previous {
            if let Err(undo) = std::fs::rename(&retired, root) {
                warn!(target_dir = %root.display(), error = %undo, "Failed to put previous directory back");
            }
        }
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    if had_previous {
        if let Err(e) = std::fs::remove_dir_all(&retired) {
            warn!(path = %retired.display(), error = %e, "Failed to remove replaced directory");
        }
    }

    debug!(target_dir = %root.display(), files = entries.len(), "Directory restored");
    Ok(())
}

fn unpack_into(staging: &Path, entries: &[ArchiveEntry]) -> Result<(), AdapterError> {
    std::fs::create_dir_all(staging)?;
    for entry in entries {
        let path = staging.join(&entry.path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, &entry.data)?;
        apply_mode(&path, entry.mode)?;
    }
    Ok(())
}
