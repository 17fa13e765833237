//! On-disk cache of depot manifests
//!
//! Each manifest is stored as `<depot>_<manifest>.manifest` next to a
//! `.blake3` sidecar holding the hex checksum of the manifest file. A missing
//! sidecar or a checksum mismatch makes the entry count as absent.

use depot_proto::{ContentHash, DepotId, ManifestId, ManifestSnapshot};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::atomic::{write_atomic, AtomicWriter};
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct ManifestCache {
    dir: PathBuf,
}

impl ManifestCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self, depot_id: DepotId, manifest_id: ManifestId) -> PathBuf {
        self.dir
            .join(format!("{}_{}.manifest", depot_id, manifest_id.0))
    }

    pub fn checksum_path(&self, depot_id: DepotId, manifest_id: ManifestId) -> PathBuf {
        self.dir
            .join(format!("{}_{}.manifest.blake3", depot_id, manifest_id.0))
    }

    /// Load a cached manifest, returning `None` when absent or failing its checksum
    pub async fn load(
        &self,
        depot_id: DepotId,
        manifest_id: ManifestId,
    ) -> Result<Option<ManifestSnapshot>> {
        let manifest_path = self.manifest_path(depot_id, manifest_id);
        let data = match fs::read(&manifest_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let expected = match fs::read_to_string(self.checksum_path(depot_id, manifest_id)).await {
            Ok(text) => match ContentHash::from_hex(&text) {
                Ok(hash) => hash,
                Err(_) => {
                    warn!("Malformed checksum sidecar for manifest {}", manifest_id);
                    return Ok(None);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Manifest {} of depot {} has no checksum", manifest_id, depot_id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let actual = ContentHash::compute(&data);
        if actual != expected {
            warn!(
                "Manifest {} of depot {} failed checksum: expected {}, got {}",
                manifest_id, depot_id, expected, actual
            );
            return Ok(None);
        }

        match ManifestSnapshot::from_bytes(&data) {
            Ok(snapshot) => {
                debug!("Loaded manifest {} of depot {} from cache", manifest_id, depot_id);
                Ok(Some(snapshot))
            }
            Err(e) => {
                warn!("Cached manifest {} is undecodable: {}", manifest_id, e);
                Ok(None)
            }
        }
    }

    /// Persist a manifest and its checksum sidecar
    pub async fn store(&self, snapshot: &ManifestSnapshot) -> Result<()> {
        let data = snapshot.to_bytes()?;
        let manifest_path = self.manifest_path(snapshot.depot_id, snapshot.manifest_id);

        let mut writer = AtomicWriter::new(&manifest_path).await?;
        if let Err(e) = writer.write(&data).await {
            writer.abort().await?;
            return Err(e);
        }
        let written = writer.commit().await?;

        write_atomic(
            self.checksum_path(snapshot.depot_id, snapshot.manifest_id),
            written.content_hash.to_hex().as_bytes(),
        )
        .await?;

        debug!(
            "Cached manifest {} of depot {} ({} bytes)",
            snapshot.manifest_id, snapshot.depot_id, written.bytes_written
        );
        Ok(())
    }
}
