//! Per-depot sync state machine
//!
//! A run first resolves every requested depot in caller order: it marks the
//! depot as being rewritten, fetches its key and manifest, and filters its
//! files. Once every depot's file list is known, names claimed by more than
//! one depot stay only with the last one. Each depot is then materialized,
//! its stale files are removed, and its install record advances.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use depot_pool::EndpointPool;
use depot_proto::{
    AppId, ContentTransport, DepotId, DepotKey, FetchOutcome, FileDescriptor, ManifestId,
    ManifestSnapshot, ManifestTicket, SessionProvider,
};
use depot_store::{InstallStateStore, ManifestCache};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::errors::{Result, SyncError};
use crate::materializer::{DepotJob, FileMaterializer};
use crate::progress::{ByteCounters, DownloadCounters, ProgressCallback, SyncProgress};
use crate::retry::fetch_once;

/// One depot to bring to a given manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotRequest {
    pub depot_id: DepotId,
    pub manifest_id: ManifestId,
}

impl DepotRequest {
    pub fn new(depot_id: DepotId, manifest_id: ManifestId) -> Self {
        Self {
            depot_id,
            manifest_id,
        }
    }
}

/// Outcome of one depot's pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepotReport {
    pub depot_id: DepotId,
    pub manifest_id: ManifestId,
    /// The manifest came from the local install without a network request
    pub already_installed: bool,
    pub files: usize,
    pub chunks_fetched: u64,
    pub bytes_downloaded_compressed: u64,
    pub bytes_downloaded_uncompressed: u64,
    /// Bytes found valid on disk and kept
    pub bytes_reused: u64,
    pub files_deleted: usize,
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub app_id: AppId,
    pub depots: Vec<DepotReport>,
    pub totals: ByteCounters,
}

/// A resolved depot awaiting materialization
struct DepotPlan {
    request: DepotRequest,
    key: DepotKey,
    already_installed: bool,
    previous: Option<Arc<ManifestSnapshot>>,
    /// Filtered entries of the new manifest, sorted by path
    files: Vec<FileDescriptor>,
    /// Normalized names of `files`, before cross-depot de-duplication
    names: HashSet<String>,
    /// Filtered files of the previous manifest, candidates for deletion
    previous_files: Vec<(String, PathBuf)>,
}

/// Drives depots from their installed manifest to the requested one
pub struct SyncOrchestrator {
    config: SyncConfig,
    session: Arc<dyn SessionProvider>,
    transport: Arc<dyn ContentTransport>,
    pool: Arc<EndpointPool>,
    install_state: InstallStateStore,
    manifest_cache: ManifestCache,
    progress: Option<ProgressCallback>,
}

impl SyncOrchestrator {
    /// Prepare the state directories and load the install state
    pub async fn new(
        config: SyncConfig,
        session: Arc<dyn SessionProvider>,
        transport: Arc<dyn ContentTransport>,
        pool: Arc<EndpointPool>,
    ) -> Result<Self> {
        for dir in [
            config.install_dir.clone(),
            config.staging_dir(),
            config.manifest_dir(),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SyncError::filesystem(&dir, "create dir", e))?;
        }

        let install_state = InstallStateStore::load(config.install_state_path()).await?;
        let manifest_cache = ManifestCache::new(config.manifest_dir());

        info!(
            "Sync orchestrator ready for {} ({} workers)",
            config.install_dir.display(),
            config.workers()
        );

        Ok(Self {
            config,
            session,
            transport,
            pool,
            install_state,
            manifest_cache,
            progress: None,
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn install_state(&self) -> &InstallStateStore {
        &self.install_state
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Stop the endpoint pool's background loop
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Sync `depots` of `app_id` in order.
    ///
    /// Cancelling `cancel` stops the run; depots already committed keep their
    /// record and the depot in progress stays marked invalid.
    pub async fn sync(
        &mut self,
        app_id: AppId,
        depots: &[DepotRequest],
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let run = cancel.child_token();
        let counters = Arc::new(DownloadCounters::new());
        info!("Syncing {} depot(s) of app {}", depots.len(), app_id);

        let mut plans = Vec::with_capacity(depots.len());
        for request in depots {
            if run.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let plan = self
                .prepare_depot(app_id, *request, &run)
                .await
                .map_err(|e| e.for_depot(app_id, request.depot_id))?;
            plans.push(plan);
        }

        let all_names: HashSet<String> = plans
            .iter()
            .flat_map(|p| p.names.iter().cloned())
            .collect();
        deduplicate(&mut plans);

        let mut reports = Vec::with_capacity(plans.len());
        for plan in plans {
            let depot_id = plan.request.depot_id;
            let report = self
                .process_depot(plan, &all_names, &counters, &run)
                .await
                .map_err(|e| e.for_depot(app_id, depot_id))?;
            reports.push(report);
        }

        let totals = counters.global().await;
        info!(
            "App {} synced: {} chunks, {} bytes downloaded",
            app_id, totals.chunks_fetched, totals.downloaded_compressed
        );
        Ok(SyncReport {
            app_id,
            depots: reports,
            totals,
        })
    }

    /// ResolveManifest: mark the depot invalid and work out what it should hold
    async fn prepare_depot(
        &mut self,
        app_id: AppId,
        request: DepotRequest,
        cancel: &CancellationToken,
    ) -> Result<DepotPlan> {
        let depot_id = request.depot_id;
        let previous_id = self.install_state.get(depot_id);

        self.install_state.set(depot_id, ManifestId::INVALID);
        self.install_state.save().await?;

        let key = self.session.depot_key(app_id, depot_id).await?;

        let previous = match previous_id {
            Some(id) if id.is_valid() => self.load_previous(depot_id, id).await,
            _ => None,
        };

        let (manifest, already_installed) = match &previous {
            Some(prev) if previous_id == Some(request.manifest_id) => {
                info!(
                    "Depot {} already at manifest {}, verifying",
                    depot_id, request.manifest_id
                );
                (prev.clone(), true)
            }
            _ => {
                let manifest = self
                    .resolve_manifest(app_id, request, &key, cancel)
                    .await?;
                (Arc::new(manifest), false)
            }
        };

        for file in &manifest.files {
            file.relative_path()?;
            file.validate_layout()?;
        }

        let mut files: Vec<FileDescriptor> = manifest
            .files
            .iter()
            .filter(|f| self.config.is_file_included(&f.path))
            .cloned()
            .collect();
        files.sort_by_cached_key(|f| f.normalized_path());
        let names = files.iter().map(|f| f.normalized_path()).collect();

        let previous_files = previous
            .iter()
            .flat_map(|m| m.files.iter())
            .filter(|f| !f.is_directory() && self.config.is_file_included(&f.path))
            .filter_map(|f| match f.relative_path() {
                Ok(relative) => Some((f.normalized_path(), relative)),
                Err(e) => {
                    warn!("Ignoring previous entry of depot {}: {}", depot_id, e);
                    None
                }
            })
            .collect();

        debug!(
            "Depot {} resolved to manifest {} with {} entries",
            depot_id,
            manifest.manifest_id,
            files.len()
        );

        Ok(DepotPlan {
            request,
            key,
            already_installed,
            previous,
            files,
            names,
            previous_files,
        })
    }

    /// The previously installed manifest, if the cache still holds a valid copy
    async fn load_previous(
        &self,
        depot_id: DepotId,
        manifest_id: ManifestId,
    ) -> Option<Arc<ManifestSnapshot>> {
        match self.manifest_cache.load(depot_id, manifest_id).await {
            Ok(Some(manifest)) => Some(Arc::new(manifest)),
            Ok(None) => {
                warn!(
                    "Previous manifest {} of depot {} not cached, verifying all files",
                    manifest_id, depot_id
                );
                None
            }
            Err(e) => {
                warn!(
                    "Failed to load previous manifest {} of depot {}: {}",
                    manifest_id, depot_id, e
                );
                None
            }
        }
    }

    /// Load the manifest from the cache, else download and cache it
    async fn resolve_manifest(
        &self,
        app_id: AppId,
        request: DepotRequest,
        key: &DepotKey,
        cancel: &CancellationToken,
    ) -> Result<ManifestSnapshot> {
        let DepotRequest {
            depot_id,
            manifest_id,
        } = request;

        if let Some(manifest) = self.manifest_cache.load(depot_id, manifest_id).await? {
            debug!("Manifest {} of depot {} loaded from cache", manifest_id, depot_id);
            return Ok(manifest);
        }

        let what = format!("manifest {} of depot {}", manifest_id, depot_id);
        let lifetime = self.config.manifest_ticket_lifetime();
        let mut ticket: Option<(ManifestTicket, Instant)> = None;

        let manifest = loop {
            let current = match ticket {
                Some((t, issued)) if issued.elapsed() < lifetime => t,
                _ => {
                    let t = self
                        .session
                        .manifest_ticket(app_id, depot_id, manifest_id, &self.config.branch)
                        .await?;
                    ticket = Some((t, Instant::now()));
                    t
                }
            };
            let fetched = fetch_once(&self.pool, cancel, &what, |endpoint| {
                let transport = self.transport.clone();
                let pool = self.pool.clone();
                let use_relay = self.config.use_relay;
                let key = key.clone();
                async move {
                    let relay = if use_relay {
                        pool.preferred_relay().await
                    } else {
                        None
                    };
                    let outcome = transport
                        .fetch_manifest(
                            depot_id,
                            manifest_id,
                            current,
                            &endpoint,
                            &key,
                            relay.as_deref(),
                        )
                        .await;
                    match outcome {
                        FetchOutcome::Success(m)
                            if m.depot_id != depot_id || m.manifest_id != manifest_id =>
                        {
                            FetchOutcome::TransientFailure(format!(
                                "answered with manifest {} of depot {}",
                                m.manifest_id, m.depot_id
                            ))
                        }
                        other => other,
                    }
                }
            })
            .await?;

            if let Some(manifest) = fetched {
                break manifest;
            }
        };

        self.manifest_cache.store(&manifest).await?;
        info!(
            "Downloaded manifest {} of depot {} ({} files)",
            manifest_id,
            depot_id,
            manifest.files.len()
        );
        Ok(manifest)
    }

    /// DiffAndPreallocate, FetchChunks, DeleteStaleFiles, CommitInstallRecord
    async fn process_depot(
        &mut self,
        plan: DepotPlan,
        all_names: &HashSet<String>,
        counters: &Arc<DownloadCounters>,
        cancel: &CancellationToken,
    ) -> Result<DepotReport> {
        let DepotRequest {
            depot_id,
            manifest_id,
        } = plan.request;
        info!("Depot {}: syncing to manifest {}", depot_id, manifest_id);

        let job = DepotJob {
            depot_id,
            key: plan.key,
            files: plan.files,
            previous: plan.previous,
        };
        FileMaterializer::new(
            &self.config,
            self.transport.clone(),
            self.pool.clone(),
            counters.clone(),
        )
        .with_progress(self.progress.clone())
        .materialize(&job, cancel)
        .await?;

        let files_deleted = self
            .delete_stale_files(depot_id, &plan.previous_files, all_names)
            .await?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        self.install_state.set(depot_id, manifest_id);
        self.install_state.save().await?;

        let depot = counters.depot(depot_id).await;
        if let Some(progress) = &self.progress {
            progress(&SyncProgress {
                depot_id,
                bytes_so_far: depot.size_downloaded,
                bytes_total: depot.complete_size,
                current_file: None,
                file_granular: false,
            });
        }
        info!(
            "Depot {} committed at manifest {}: {} chunks fetched, {} files deleted",
            depot_id, manifest_id, depot.chunks_fetched, files_deleted
        );

        Ok(DepotReport {
            depot_id,
            manifest_id,
            already_installed: plan.already_installed,
            files: job.files.len(),
            chunks_fetched: depot.chunks_fetched,
            bytes_downloaded_compressed: depot.downloaded_compressed,
            bytes_downloaded_uncompressed: depot.downloaded_uncompressed,
            bytes_reused: depot
                .size_downloaded
                .saturating_sub(depot.downloaded_uncompressed),
            files_deleted,
        })
    }

    /// Remove files of the previous manifest that no depot of this run claims
    async fn delete_stale_files(
        &self,
        depot_id: DepotId,
        previous_files: &[(String, PathBuf)],
        all_names: &HashSet<String>,
    ) -> Result<usize> {
        let mut deleted = 0;
        for (name, relative) in previous_files {
            if all_names.contains(name) {
                continue;
            }
            let path = self.config.install_dir.join(relative);
            if !path.is_file() {
                continue;
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| SyncError::filesystem(&path, "delete stale file", e))?;
            debug!("Depot {}: deleted stale file {}", depot_id, name);
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// Keep each file name only in the last depot that declares it
fn deduplicate(plans: &mut [DepotPlan]) {
    let mut claimed = HashSet::new();
    for plan in plans.iter_mut().rev() {
        let depot_id = plan.request.depot_id;
        plan.files.retain(|f| {
            if f.is_directory() {
                return true;
            }
            let keep = claimed.insert(f.normalized_path());
            if !keep {
                debug!("Depot {}: {} is owned by a later depot", depot_id, f.path);
            }
            keep
        });
    }
}
