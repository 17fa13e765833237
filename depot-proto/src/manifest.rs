use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::errors::{ProtoError, Result};
use crate::hash::{ChunkId, ContentHash};

pub type AppId = u32;
pub type DepotId = u32;
pub type UgcId = u64;

/// Identifier of one immutable manifest version of a depot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestId(pub u64);

impl ManifestId {
    /// Sentinel recorded while a depot is being rewritten
    pub const INVALID: ManifestId = ManifestId(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "<invalid>")
        }
    }
}

/// One content-addressed byte range of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub id: ChunkId,
    /// Checksum of the uncompressed chunk bytes
    pub checksum: ContentHash,
    pub offset: u64,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
}

impl ChunkDescriptor {
    /// Exclusive end offset of this chunk within the file
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.uncompressed_len)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFlags {
    pub directory: bool,
    pub executable: bool,
}

/// File entry in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: String,
    pub total_size: u64,
    pub chunks: Vec<ChunkDescriptor>,
    pub flags: FileFlags,
    /// Hash of the complete file content
    pub content_hash: ContentHash,
}

impl FileDescriptor {
    pub fn is_directory(&self) -> bool {
        self.flags.directory
    }

    /// Canonical name of this entry; two spellings of one on-disk path share it
    pub fn normalized_path(&self) -> String {
        normalize_path(&self.path)
    }

    /// Relative filesystem path for this entry.
    ///
    /// Rejects absolute paths and parent-directory components so that no
    /// manifest can address anything outside the install tree.
    pub fn relative_path(&self) -> Result<PathBuf> {
        let separated = self.path.replace('\\', "/");
        if separated.starts_with('/') {
            return Err(ProtoError::InvalidPath(self.path.clone()));
        }

        let mut path = PathBuf::new();
        for component in separated.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err(ProtoError::InvalidPath(self.path.clone())),
                c if c.ends_with(':') => return Err(ProtoError::InvalidPath(self.path.clone())),
                c => path.push(c),
            }
        }

        if path.as_os_str().is_empty() {
            return Err(ProtoError::InvalidPath(self.path.clone()));
        }
        Ok(path)
    }

    /// Chunks ordered by offset
    pub fn sorted_chunks(&self) -> Vec<&ChunkDescriptor> {
        let mut chunks: Vec<_> = self.chunks.iter().collect();
        chunks.sort_by_key(|c| c.offset);
        chunks
    }

    /// Check that chunk ranges are disjoint and tile exactly `total_size` bytes
    pub fn validate_layout(&self) -> Result<()> {
        if self.is_directory() {
            if !self.chunks.is_empty() {
                return Err(self.layout_error("directory entry carries chunks".to_string()));
            }
            return Ok(());
        }

        let mut expected = 0u64;
        for chunk in self.sorted_chunks() {
            if chunk.offset != expected {
                return Err(self.layout_error(format!(
                    "chunk {} starts at {} but previous range ends at {}",
                    chunk.id, chunk.offset, expected
                )));
            }
            expected = chunk.end();
        }

        if expected != self.total_size {
            return Err(self.layout_error(format!(
                "chunks cover {} bytes, file declares {}",
                expected, self.total_size
            )));
        }
        Ok(())
    }

    fn layout_error(&self, reason: String) -> ProtoError {
        ProtoError::InvalidLayout {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Canonical form of a manifest path: `/` separators, no empty or `.` components
pub fn normalize_path(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// A depot manifest: the listing of one depot version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestSnapshot {
    pub depot_id: DepotId,
    pub manifest_id: ManifestId,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileDescriptor>,
}

impl ManifestSnapshot {
    pub fn new(depot_id: DepotId, manifest_id: ManifestId, files: Vec<FileDescriptor>) -> Self {
        Self {
            depot_id,
            manifest_id,
            created_at: Utc::now(),
            files,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
