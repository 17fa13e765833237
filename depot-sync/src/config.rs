//! Sync configuration

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use depot_proto::manifest::normalize_path;

use crate::errors::{Result, SyncError};

const STATE_DIR_NAME: &str = ".depotsync";

/// Configuration for a sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the content tree
    pub install_dir: PathBuf,
    /// Where install state, manifests and staging files live
    pub state_dir: Option<PathBuf>,
    /// Width of the worker pool for diffing and chunk downloads
    pub max_downloads: usize,
    /// Re-verify every reused chunk even when whole-file hashes match
    pub verify_all: bool,
    /// Route requests through the pool's preferred relay
    pub use_relay: bool,
    /// Branch passed when requesting manifest tickets
    pub branch: String,
    /// Restrict the sync to these manifest paths
    pub files_to_download: Option<HashSet<String>>,
    /// Seconds a manifest ticket stays valid
    pub manifest_ticket_lifetime_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("depots"),
            state_dir: None,
            max_downloads: 8,
            verify_all: false,
            use_relay: false,
            branch: "public".to_string(),
            files_to_download: None,
            manifest_ticket_lifetime_secs: 5 * 60,
        }
    }
}

impl SyncConfig {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            ..Default::default()
        }
    }

    /// Load a TOML configuration file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::filesystem(path, "read config", e))?;
        toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.join(STATE_DIR_NAME))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.state_dir().join("manifests")
    }

    pub fn install_state_path(&self) -> PathBuf {
        self.state_dir().join("depot.config")
    }

    pub fn manifest_ticket_lifetime(&self) -> Duration {
        Duration::from_secs(self.manifest_ticket_lifetime_secs)
    }

    /// Worker pool width, never zero
    pub fn workers(&self) -> usize {
        self.max_downloads.max(1)
    }

    /// Whether a manifest path passes the file filter
    pub fn is_file_included(&self, path: &str) -> bool {
        match &self.files_to_download {
            None => true,
            Some(files) => {
                let wanted = normalize_path(path);
                files.iter().any(|f| normalize_path(f) == wanted)
            }
        }
    }
}
