//! Chunk-level diff between an installed file and its new manifest entry
//!
//! Given the previous descriptor of a file (if any), its new descriptor and
//! whatever is currently on disk, the engine works out which chunks must be
//! downloaded and moves every reusable byte range to its new offset. Chunks
//! are matched by content id, not by offset, and every reused range is
//! re-checksummed before it is trusted.
//!
//! All I/O here is blocking; callers run it on the blocking thread pool.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use depot_proto::{ChunkDescriptor, ChunkId, ContentHash, FileDescriptor};
use tracing::{debug, trace};

use crate::errors::{Result, SyncError};

/// An old chunk whose bytes can be reused for a new chunk with the same content id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMatch {
    pub old: ChunkDescriptor,
    pub new: ChunkDescriptor,
}

/// How the file on disk was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// Nothing on disk; a blank file of the final size was allocated
    Preallocated,
    /// Existing chunks were checked in place against the new descriptor
    Verified,
    /// Reusable chunks were matched against the previous descriptor
    Matched,
}

/// Outcome of diffing one file
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub kind: DiffKind,
    /// Chunks that must be fetched
    pub needed: Vec<ChunkDescriptor>,
    /// Byte ranges carried over from the previous version
    pub reused: Vec<ChunkMatch>,
    /// Whether the file was rewritten through the staging path
    pub rewritten: bool,
}

impl FileDiff {
    pub fn needed_bytes(&self) -> u64 {
        self.needed
            .iter()
            .map(|c| u64::from(c.uncompressed_len))
            .sum()
    }
}

/// Computes needed chunks and relocates reusable ones
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkDiffEngine {
    verify_all: bool,
}

impl ChunkDiffEngine {
    pub fn new(verify_all: bool) -> Self {
        Self { verify_all }
    }

    /// Diff one file and prepare it on disk.
    ///
    /// On return the file at `final_path` has exactly `new.total_size` bytes
    /// and every byte outside the returned `needed` chunks is correct.
    pub fn diff_file(
        &self,
        old: Option<&FileDescriptor>,
        new: &FileDescriptor,
        final_path: &Path,
        staging_path: &Path,
    ) -> Result<FileDiff> {
        let on_disk_len = match fs::metadata(final_path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::filesystem(final_path, "stat", e)),
        };

        let Some(on_disk_len) = on_disk_len else {
            preallocate(final_path, new.total_size)?;
            debug!(
                "Allocated {} ({} bytes, {} chunks needed)",
                new.path,
                new.total_size,
                new.chunks.len()
            );
            return Ok(FileDiff {
                kind: DiffKind::Preallocated,
                needed: new.chunks.clone(),
                reused: Vec::new(),
                rewritten: false,
            });
        };

        match old {
            Some(old) if self.verify_all || old.content_hash != new.content_hash => {
                self.match_against_previous(old, new, final_path, staging_path, on_disk_len)
            }
            _ => self.verify_in_place(new, final_path, on_disk_len),
        }
    }

    /// Check every chunk of `new` against the bytes currently on disk
    fn verify_in_place(
        &self,
        new: &FileDescriptor,
        final_path: &Path,
        on_disk_len: u64,
    ) -> Result<FileDiff> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(final_path)
            .map_err(|e| SyncError::filesystem(final_path, "open", e))?;

        if on_disk_len != new.total_size {
            debug!(
                "Resizing {} from {} to {} bytes",
                new.path, on_disk_len, new.total_size
            );
            file.set_len(new.total_size)
                .map_err(|e| SyncError::filesystem(final_path, "resize", e))?;
        }

        let mut needed = Vec::new();
        for chunk in new.sorted_chunks() {
            // Bytes past the old end of file are zero fill from the resize
            if chunk.end() > on_disk_len
                || !range_matches(&mut file, chunk.offset, chunk.uncompressed_len, &chunk.checksum)
                    .map_err(|e| SyncError::filesystem(final_path, "read", e))?
            {
                needed.push(chunk.clone());
            }
        }

        debug!(
            "Verified {}: {}/{} chunks need download",
            new.path,
            needed.len(),
            new.chunks.len()
        );
        Ok(FileDiff {
            kind: DiffKind::Verified,
            needed,
            reused: Vec::new(),
            rewritten: false,
        })
    }

    /// Match chunks of `new` to chunks of `old` by content id and relocate them
    fn match_against_previous(
        &self,
        old: &FileDescriptor,
        new: &FileDescriptor,
        final_path: &Path,
        staging_path: &Path,
        on_disk_len: u64,
    ) -> Result<FileDiff> {
        let old_by_id: HashMap<&ChunkId, &ChunkDescriptor> = old
            .chunks
            .iter()
            .rev()
            .map(|c| (&c.id, c))
            .collect();

        let mut needed = Vec::new();
        let mut candidates = Vec::new();
        for chunk in &new.chunks {
            match old_by_id.get(&chunk.id) {
                Some(old_chunk) => candidates.push(ChunkMatch {
                    old: (*old_chunk).clone(),
                    new: chunk.clone(),
                }),
                None => needed.push(chunk.clone()),
            }
        }
        candidates.sort_by_key(|m| m.old.offset);

        let mut reused = Vec::with_capacity(candidates.len());
        {
            let mut file =
                File::open(final_path).map_err(|e| SyncError::filesystem(final_path, "open", e))?;
            for candidate in candidates {
                let valid = candidate.old.end() <= on_disk_len
                    && range_matches(
                        &mut file,
                        candidate.old.offset,
                        candidate.old.uncompressed_len,
                        &candidate.old.checksum,
                    )
                    .map_err(|e| SyncError::filesystem(final_path, "read", e))?;

                if valid {
                    reused.push(candidate);
                } else {
                    trace!(
                        "Reusable chunk {} of {} is corrupt on disk",
                        candidate.old.id,
                        new.path
                    );
                    needed.push(candidate.new);
                }
            }
        }

        let hash_matches = old.content_hash == new.content_hash;
        let rewritten = !hash_matches || !needed.is_empty();
        if rewritten {
            relocate(final_path, staging_path, new.total_size, &reused)?;
        } else if on_disk_len != new.total_size {
            resize(final_path, new.total_size)?;
        }

        debug!(
            "Matched {}: {} chunks reused, {} need download",
            new.path,
            reused.len(),
            needed.len()
        );
        Ok(FileDiff {
            kind: DiffKind::Matched,
            needed,
            reused,
            rewritten,
        })
    }
}

/// Create parent directories and a zero-filled file of `size` bytes
fn preallocate(path: &Path, size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::filesystem(parent, "create dir", e))?;
    }
    let file = File::create(path).map_err(|e| SyncError::filesystem(path, "create", e))?;
    file.set_len(size)
        .map_err(|e| SyncError::filesystem(path, "allocate", e))
}

fn resize(path: &Path, size: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| SyncError::filesystem(path, "open", e))?;
    file.set_len(size)
        .map_err(|e| SyncError::filesystem(path, "resize", e))
}

/// Move the file aside, allocate a fresh one and copy every reused range into place
fn relocate(
    final_path: &Path,
    staging_path: &Path,
    total_size: u64,
    reused: &[ChunkMatch],
) -> Result<()> {
    if let Some(parent) = staging_path.parent() {
        fs::create_dir_all(parent).map_err(|e| SyncError::filesystem(parent, "create dir", e))?;
    }
    fs::rename(final_path, staging_path)
        .map_err(|e| SyncError::filesystem(final_path, "move to staging", e))?;

    {
        let mut staged =
            File::open(staging_path).map_err(|e| SyncError::filesystem(staging_path, "open", e))?;
        let mut target =
            File::create(final_path).map_err(|e| SyncError::filesystem(final_path, "create", e))?;
        target
            .set_len(total_size)
            .map_err(|e| SyncError::filesystem(final_path, "allocate", e))?;

        let mut buf = Vec::new();
        for m in reused {
            buf.resize(m.old.uncompressed_len as usize, 0);
            staged
                .seek(SeekFrom::Start(m.old.offset))
                .and_then(|_| staged.read_exact(&mut buf))
                .map_err(|e| SyncError::filesystem(staging_path, "read", e))?;
            target
                .seek(SeekFrom::Start(m.new.offset))
                .and_then(|_| target.write_all(&buf))
                .map_err(|e| SyncError::filesystem(final_path, "write", e))?;
        }
        target
            .flush()
            .map_err(|e| SyncError::filesystem(final_path, "flush", e))?;
    }

    fs::remove_file(staging_path).map_err(|e| SyncError::filesystem(staging_path, "remove", e))
}

fn range_matches(
    file: &mut File,
    offset: u64,
    len: u32,
    expected: &ContentHash,
) -> std::io::Result<bool> {
    let mut buf = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(ContentHash::compute(&buf) == *expected),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Staging location of a file below `staging_dir`
pub fn staging_path_for(staging_dir: &Path, relative: &Path) -> PathBuf {
    staging_dir.join(relative)
}
