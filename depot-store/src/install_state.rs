//! Durable record of which manifest is materialized for each depot
//!
//! The file holds a short magic header followed by a zstd-compressed bincode
//! body. The sync orchestrator writes `ManifestId::INVALID` for a depot
//! before touching its files and the real manifest id only once the depot's
//! pass has fully succeeded, so an interrupted run leaves the depot marked
//! for re-validation.

use depot_proto::{DepotId, ManifestId, UgcId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::errors::{Result, StoreError};

const STATE_MAGIC: &[u8; 4] = b"DSIS";
const STATE_VERSION: u8 = 1;
const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct InstallState {
    installed_manifests: BTreeMap<DepotId, ManifestId>,
    installed_ugc_manifests: BTreeMap<UgcId, ManifestId>,
}

/// Install state bound to one file on disk
#[derive(Debug)]
pub struct InstallStateStore {
    path: PathBuf,
    state: InstallState,
}

impl InstallStateStore {
    /// Load the store from `path`, or start empty if the file does not exist.
    ///
    /// An unreadable file is treated as empty: every depot then goes through
    /// full verification on the next sync.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(data) => match decode_state(&path, &data) {
                Ok(state) => {
                    info!(
                        "Loaded install state for {} depots from {}",
                        state.installed_manifests.len(),
                        path.display()
                    );
                    state
                }
                Err(e) => {
                    warn!(
                        "Discarding unreadable install state {}: {}",
                        path.display(),
                        e
                    );
                    InstallState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No install state at {}, starting empty", path.display());
                InstallState::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, state })
    }

    /// Installed manifest of a depot; `None` if never recorded
    pub fn get(&self, depot_id: DepotId) -> Option<ManifestId> {
        self.state.installed_manifests.get(&depot_id).copied()
    }

    pub fn set(&mut self, depot_id: DepotId, manifest_id: ManifestId) {
        self.state.installed_manifests.insert(depot_id, manifest_id);
    }

    pub fn get_ugc(&self, ugc_id: UgcId) -> Option<ManifestId> {
        self.state.installed_ugc_manifests.get(&ugc_id).copied()
    }

    pub fn set_ugc(&mut self, ugc_id: UgcId, manifest_id: ManifestId) {
        self.state.installed_ugc_manifests.insert(ugc_id, manifest_id);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize, compress and atomically replace the bound file
    pub async fn save(&self) -> Result<()> {
        let body = bincode::serialize(&self.state)?;
        let compressed = zstd::encode_all(&body[..], COMPRESSION_LEVEL)?;

        let mut data = Vec::with_capacity(STATE_MAGIC.len() + 1 + compressed.len());
        data.extend_from_slice(STATE_MAGIC);
        data.push(STATE_VERSION);
        data.extend_from_slice(&compressed);

        write_atomic(&self.path, &data).await?;
        debug!(
            "Saved install state ({} depots) to {}",
            self.state.installed_manifests.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn decode_state(path: &Path, data: &[u8]) -> Result<InstallState> {
    let header_len = STATE_MAGIC.len() + 1;
    if data.len() < header_len
        || &data[..STATE_MAGIC.len()] != STATE_MAGIC
        || data[STATE_MAGIC.len()] != STATE_VERSION
    {
        return Err(StoreError::Format(path.to_path_buf()));
    }

    let body = zstd::decode_all(&data[header_len..])?;
    Ok(bincode::deserialize(&body)?)
}
