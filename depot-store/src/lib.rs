//! Persistent state for depotsync
//!
//! - [`InstallStateStore`]: compressed map of depot id to installed manifest id
//! - [`ManifestCache`]: one file per (depot, manifest) plus a checksum sidecar
//! - [`AtomicWriter`]: temp-file-and-rename writes shared by both

pub mod atomic;
pub mod errors;
pub mod install_state;
pub mod manifest_cache;

pub use atomic::{write_atomic, AtomicWriteResult, AtomicWriter};
pub use errors::{Result, StoreError};
pub use install_state::InstallStateStore;
pub use manifest_cache::ManifestCache;
