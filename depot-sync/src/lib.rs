//! Synchronization engine for depotsync
//!
//! This crate brings an install tree in line with a set of depot manifests:
//! - Chunk-level diffing against what is already on disk
//! - Concurrent chunk download and in-place file materialization
//! - Download counters and progress reporting
//! - The per-depot sync state machine and its install records

pub mod config;
pub mod diff;
pub mod errors;
pub mod materializer;
pub mod orchestrator;
pub mod progress;
mod retry;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use diff::{ChunkDiffEngine, ChunkMatch, DiffKind, FileDiff};
pub use errors::{Result, SyncError};
pub use materializer::{DepotJob, FileMaterializer};
pub use orchestrator::{DepotReport, DepotRequest, SyncOrchestrator, SyncReport};
pub use progress::{ByteCounters, DownloadCounters, ProgressCallback, SyncProgress};
