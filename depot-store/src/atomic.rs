//! Atomic file replacement for crash safety

use blake3::Hasher;
use depot_proto::ContentHash;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::{Result, StoreError};

/// Writes to a temporary sibling file and renames it over the target on commit.
///
/// Readers observe either the previous content or the complete new content,
/// never a partial write.
pub struct AtomicWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    file: Option<fs::File>,
    hasher: Hasher,
    bytes_written: u64,
}

impl AtomicWriter {
    /// Create a new atomic writer for the given path
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        let temp_path = final_path.with_extension(format!(
            "{}.tmp.{}",
            final_path
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or(""),
            uuid::Uuid::new_v4().simple()
        ));

        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = fs::File::create(&temp_path).await?;

        Ok(Self {
            final_path,
            temp_path,
            file: Some(file),
            hasher: Hasher::new(),
            bytes_written: 0,
        })
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StoreError::InvalidOperation("Writer already finalized".to_string()))?;
        file.write_all(data).await?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Sync the temporary file and move it over the target
    pub async fn commit(mut self) -> Result<AtomicWriteResult> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| StoreError::InvalidOperation("Writer already finalized".to_string()))?;

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&self.temp_path, &self.final_path).await?;

        let hash = ContentHash::from_blake3(self.hasher.finalize());
        debug!(
            "Committed {} ({} bytes, hash {})",
            self.final_path.display(),
            self.bytes_written,
            hash
        );

        Ok(AtomicWriteResult {
            path: self.final_path.clone(),
            bytes_written: self.bytes_written,
            content_hash: hash,
        })
    }

    /// Discard the temporary file
    pub async fn abort(mut self) -> Result<()> {
        if self.file.take().is_some() {
            if let Err(e) = fs::remove_file(&self.temp_path).await {
                warn!(
                    "Failed to clean up temp file {}: {}",
                    self.temp_path.display(),
                    e
                );
            }
        }
        Ok(())
    }
}

/// Result of successful atomic write
#[derive(Debug, Clone)]
pub struct AtomicWriteResult {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub content_hash: ContentHash,
}

/// Replace `path` with `data` atomically
pub async fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<AtomicWriteResult> {
    let mut writer = AtomicWriter::new(path).await?;
    if let Err(e) = writer.write(data).await {
        writer.abort().await?;
        return Err(e);
    }
    writer.commit().await
}
