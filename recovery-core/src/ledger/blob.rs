//! Component blob files: compression, durable writes and checksum verification.

use super::{ComponentResult, validate_segment};
use crate::config::Compression;
use crate::utils::atomic::write_atomic;
use crate::utils::errors::{RecoveryError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::Path;

/// What was written for one component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub file_name: String,
    pub checksum: String,
    pub size: u64,
    pub stored_size: u64,
}

/// Lowercase hex SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Writes and reads blob files inside a backup directory.
#[derive(Debug, Clone, Copy)]
pub struct BlobStore {
    compression: Compression,
    level: i32,
}

impl BlobStore {
    pub fn new(compression: Compression, level: i32) -> Self {
        Self { compression, level }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn file_name(component: &str) -> String {
        format!("{}.blob", component)
    }

    /// Durably write `data` for `component` under `backup_dir`.
    ///
    /// The checksum and size describe the uncompressed payload.
    pub async fn write(&self, backup_dir: &Path, component: &str, data: Bytes) -> Result<StoredBlob> {
        validate_segment(component, "component name")?;
        let file_name = Self::file_name(component);
        let checksum = checksum(&data);
        let size = data.len() as u64;

        let encoded = match self.compression {
            Compression::None => data,
            Compression::Zstd => {
                let level = self.level;
                let compressed = tokio::task::spawn_blocking(move || zstd::bulk::compress(&data, level))
                    .await
                    .map_err(std::io::Error::other)??;
                Bytes::from(compressed)
            }
        };

        write_atomic(&backup_dir.join(&file_name), &encoded).await?;

        Ok(StoredBlob {
            file_name,
            checksum,
            size,
            stored_size: encoded.len() as u64,
        })
    }

    /// Read the blob recorded in `result` and verify it against the recorded checksum.
    ///
    /// A missing, undecodable, or mismatching blob is a corruption error.
    pub async fn read_verified(
        backup_dir: &Path,
        component: &str,
        compression: Compression,
        result: &ComponentResult,
    ) -> Result<Bytes> {
        let corruption = |actual: String| RecoveryError::Corruption {
            component: component.to_string(),
            expected: result.checksum.clone().unwrap_or_else(|| "<none>".to_string()),
            actual,
        };

        let (Some(file_name), Some(expected)) = (result.blob.as_deref(), result.checksum.as_deref())
        else {
            return Err(corruption("<no blob recorded>".to_string()));
        };
        validate_segment(file_name, "blob file name")?;

        let raw = match tokio::fs::read(backup_dir.join(file_name)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(corruption("<missing blob file>".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let data = match compression {
            Compression::None => raw,
            Compression::Zstd => tokio::task::spawn_blocking(move || zstd::stream::decode_all(&raw[..]))
                .await
                .map_err(std::io::Error::other)?
                .map_err(|e| corruption(format!("<undecodable blob: {}>", e)))?,
        };

        let actual = checksum(&data);
        if actual != expected || data.len() as u64 != result.size {
            return Err(corruption(actual));
        }
        Ok(Bytes::from(data))
    }
}
