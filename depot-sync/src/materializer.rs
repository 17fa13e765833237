//! Concurrent materialization of one depot's files
//!
//! Work runs in two phases over a worker pool of fixed width. Phase one diffs
//! every file against what is on disk, in parallel. Phase two downloads all
//! chunks the diffs asked for, across all files at once, and writes each one
//! at its offset. A file's handle is opened by the first chunk that lands and
//! closed by whichever writer lands the last one.
//!
//! A fatal failure in any worker cancels the run token so that every other
//! worker, and the orchestrator above, stops.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use depot_pool::EndpointPool;
use depot_proto::{
    ChunkDescriptor, ContentHash, ContentTransport, DepotId, DepotKey, FetchOutcome,
    FileDescriptor, ManifestSnapshot,
};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::diff::{staging_path_for, ChunkDiffEngine, FileDiff};
use crate::errors::{Result, SyncError};
use crate::progress::{DownloadCounters, ProgressCallback, SyncProgress};
use crate::retry::fetch_with_retry;

/// Files of one depot to bring in line with its manifest
#[derive(Debug, Clone)]
pub struct DepotJob {
    pub depot_id: DepotId,
    pub key: DepotKey,
    /// Filtered, de-duplicated entries of the new manifest
    pub files: Vec<FileDescriptor>,
    /// Manifest previously installed for this depot, if known
    pub previous: Option<Arc<ManifestSnapshot>>,
}

/// A diffed file awaiting its chunks
struct FilePlan {
    descriptor: FileDescriptor,
    final_path: PathBuf,
    diff: FileDiff,
}

/// Shared write target for all chunks of one file
struct FileStream {
    path: String,
    final_path: PathBuf,
    executable: bool,
    handle: Mutex<Option<tokio::fs::File>>,
    chunks_remaining: AtomicUsize,
}

/// Everything a chunk worker needs, shared across workers of one depot
struct ChunkContext {
    depot_id: DepotId,
    key: DepotKey,
    use_relay: bool,
    transport: Arc<dyn ContentTransport>,
    pool: Arc<EndpointPool>,
    counters: Arc<DownloadCounters>,
    progress: Option<ProgressCallback>,
}

/// Fetches needed chunks and writes them into place under bounded concurrency
pub struct FileMaterializer {
    transport: Arc<dyn ContentTransport>,
    pool: Arc<EndpointPool>,
    counters: Arc<DownloadCounters>,
    progress: Option<ProgressCallback>,
    engine: ChunkDiffEngine,
    install_dir: PathBuf,
    staging_dir: PathBuf,
    workers: usize,
    use_relay: bool,
}

impl FileMaterializer {
    pub fn new(
        config: &SyncConfig,
        transport: Arc<dyn ContentTransport>,
        pool: Arc<EndpointPool>,
        counters: Arc<DownloadCounters>,
    ) -> Self {
        Self {
            transport,
            pool,
            counters,
            progress: None,
            engine: ChunkDiffEngine::new(config.verify_all),
            install_dir: config.install_dir.clone(),
            staging_dir: config.staging_dir(),
            workers: config.workers(),
            use_relay: config.use_relay,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Diff, preallocate and download every file of `job`
    pub async fn materialize(&self, job: &DepotJob, cancel: &CancellationToken) -> Result<()> {
        let expected: u64 = job
            .files
            .iter()
            .filter(|f| !f.is_directory())
            .map(|f| f.total_size)
            .sum();
        self.counters.add_expected(job.depot_id, expected).await;

        self.create_directories(job).await?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let plans = self.diff_files(job, cancel).await?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.fetch_chunks(job, plans, cancel).await
    }

    async fn create_directories(&self, job: &DepotJob) -> Result<()> {
        for dir in job.files.iter().filter(|f| f.is_directory()) {
            let path = self.install_dir.join(dir.relative_path()?);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| SyncError::filesystem(&path, "create dir", e))?;
        }
        Ok(())
    }

    /// Phase one: diff all files in parallel
    async fn diff_files(&self, job: &DepotJob, cancel: &CancellationToken) -> Result<Vec<FilePlan>> {
        let previous: HashMap<String, &FileDescriptor> = job
            .previous
            .iter()
            .flat_map(|m| m.files.iter())
            .map(|f| (f.normalized_path(), f))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for file in job.files.iter().filter(|f| !f.is_directory()) {
            let relative = file.relative_path()?;
            let final_path = self.install_dir.join(&relative);
            let staging_path = staging_path_for(&self.staging_dir, &relative);
            let old = previous.get(&file.normalized_path()).map(|f| (*f).clone());
            let descriptor = file.clone();
            let engine = self.engine;
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| SyncError::Cancelled)?
                    }
                };

                tokio::task::spawn_blocking(move || -> Result<FilePlan> {
                    let diff =
                        engine.diff_file(old.as_ref(), &descriptor, &final_path, &staging_path)?;
                    Ok(FilePlan {
                        descriptor,
                        final_path,
                        diff,
                    })
                })
                .await
                .map_err(|e| SyncError::Worker(e.to_string()))?
            });
        }

        let plans = drain(tasks, cancel).await?;
        let needed: usize = plans.iter().map(|p| p.diff.needed.len()).sum();
        info!(
            "Depot {}: diffed {} files, {} chunks to download",
            job.depot_id,
            plans.len(),
            needed
        );
        Ok(plans)
    }

    /// Phase two: download every needed chunk across all files
    async fn fetch_chunks(
        &self,
        job: &DepotJob,
        plans: Vec<FilePlan>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let ctx = Arc::new(ChunkContext {
            depot_id: job.depot_id,
            key: job.key.clone(),
            use_relay: self.use_relay,
            transport: self.transport.clone(),
            pool: self.pool.clone(),
            counters: self.counters.clone(),
            progress: self.progress.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for plan in plans {
            let in_place = plan.descriptor.total_size - plan.diff.needed_bytes();
            self.counters.record_in_place(job.depot_id, in_place).await;

            let stream = Arc::new(FileStream {
                path: plan.descriptor.path.clone(),
                final_path: plan.final_path,
                executable: plan.descriptor.flags.executable,
                handle: Mutex::new(None),
                chunks_remaining: AtomicUsize::new(plan.diff.needed.len()),
            });

            if plan.diff.needed.is_empty() {
                let ctx = ctx.clone();
                tasks.spawn(async move { finish_file(&ctx, &stream).await });
                continue;
            }

            for chunk in plan.diff.needed {
                let ctx = ctx.clone();
                let stream = stream.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();

                tasks.spawn(async move {
                    let _permit = tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        permit = semaphore.acquire_owned() => {
                            permit.map_err(|_| SyncError::Cancelled)?
                        }
                    };
                    process_chunk(&ctx, &stream, &chunk, &cancel).await
                });
            }
        }

        drain(tasks, cancel).await?;
        Ok(())
    }
}

/// Fetch, validate and write one chunk; close the file if it was the last
async fn process_chunk(
    ctx: &ChunkContext,
    stream: &FileStream,
    chunk: &ChunkDescriptor,
    cancel: &CancellationToken,
) -> Result<()> {
    let (compressed_len, data) = download_chunk(ctx, chunk, cancel).await?;
    write_chunk(stream, chunk, &data).await?;

    ctx.counters
        .record_chunk(ctx.depot_id, compressed_len, data.len() as u64)
        .await;

    let remaining = stream.chunks_remaining.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 {
        finish_file(ctx, stream).await?;
    }
    Ok(())
}

async fn download_chunk(
    ctx: &ChunkContext,
    chunk: &ChunkDescriptor,
    cancel: &CancellationToken,
) -> Result<(u64, Vec<u8>)> {
    let what = format!("chunk {} of depot {}", chunk.id, ctx.depot_id);

    fetch_with_retry(&ctx.pool, cancel, &what, |endpoint| {
        let transport = ctx.transport.clone();
        let pool = ctx.pool.clone();
        let use_relay = ctx.use_relay;
        let key = ctx.key.clone();
        let chunk = chunk.clone();
        let depot_id = ctx.depot_id;

        async move {
            let relay = if use_relay {
                pool.preferred_relay().await
            } else {
                None
            };
            let outcome = transport
                .fetch_chunk(depot_id, &chunk, &endpoint, &key, relay.as_deref())
                .await;
            match outcome {
                FetchOutcome::Success(payload) => match decode_chunk(&chunk, &payload) {
                    Ok(data) => FetchOutcome::Success((payload.len() as u64, data)),
                    Err(reason) => FetchOutcome::TransientFailure(reason),
                },
                FetchOutcome::TransientFailure(reason) => FetchOutcome::TransientFailure(reason),
                FetchOutcome::FatalFailure(reason) => FetchOutcome::FatalFailure(reason),
            }
        }
    })
    .await
}

/// Decompress a payload if needed and check it against the descriptor
fn decode_chunk(chunk: &ChunkDescriptor, payload: &Bytes) -> std::result::Result<Vec<u8>, String> {
    let data = if chunk.compressed_len != chunk.uncompressed_len {
        zstd::decode_all(&payload[..]).map_err(|e| format!("decompression failed: {}", e))?
    } else {
        payload.to_vec()
    };

    if data.len() != chunk.uncompressed_len as usize {
        return Err(format!(
            "length mismatch: expected {} bytes, got {}",
            chunk.uncompressed_len,
            data.len()
        ));
    }
    if ContentHash::compute(&data) != chunk.checksum {
        return Err("checksum mismatch".to_string());
    }
    Ok(data)
}

async fn write_chunk(stream: &FileStream, chunk: &ChunkDescriptor, data: &[u8]) -> Result<()> {
    let mut handle = stream.handle.lock().await;
    if handle.is_none() {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&stream.final_path)
            .await
            .map_err(|e| SyncError::filesystem(&stream.final_path, "open", e))?;
        *handle = Some(file);
    }
    let Some(file) = handle.as_mut() else {
        return Err(SyncError::Worker(format!("no handle for {}", stream.path)));
    };

    file.seek(SeekFrom::Start(chunk.offset))
        .await
        .map_err(|e| SyncError::filesystem(&stream.final_path, "seek", e))?;
    file.write_all(data)
        .await
        .map_err(|e| SyncError::filesystem(&stream.final_path, "write", e))?;

    trace!("Wrote chunk {} at {} in {}", chunk.id, chunk.offset, stream.path);
    Ok(())
}

/// Close the file, apply its mode and report it
async fn finish_file(ctx: &ChunkContext, stream: &FileStream) -> Result<()> {
    if let Some(mut file) = stream.handle.lock().await.take() {
        file.flush()
            .await
            .map_err(|e| SyncError::filesystem(&stream.final_path, "flush", e))?;
    }

    if stream.executable {
        set_executable(&stream.final_path).await?;
    }

    let counters = ctx.counters.depot(ctx.depot_id).await;
    debug!(
        "Completed {} ({:.2}% of depot {})",
        stream.path,
        percentage(counters.size_downloaded, counters.complete_size),
        ctx.depot_id
    );

    if let Some(progress) = &ctx.progress {
        progress(&SyncProgress {
            depot_id: ctx.depot_id,
            bytes_so_far: counters.size_downloaded,
            bytes_total: counters.complete_size,
            current_file: Some(stream.path.clone()),
            file_granular: true,
        });
    }
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| SyncError::filesystem(path, "set permissions", e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

fn percentage(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

/// Join every worker; the first real failure cancels the rest and is returned
async fn drain<T: 'static>(
    mut tasks: JoinSet<Result<T>>,
    cancel: &CancellationToken,
) -> Result<Vec<T>> {
    let mut results = Vec::new();
    let mut first_error: Option<SyncError> = None;

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.unwrap_or_else(|e| Err(SyncError::Worker(e.to_string())));
        match outcome {
            Ok(value) => results.push(value),
            Err(e) => {
                if !e.is_cancelled() && !cancel.is_cancelled() {
                    error!("Cancelling run: {}", e);
                    cancel.cancel();
                }
                let replace = match &first_error {
                    None => true,
                    Some(prev) => prev.is_cancelled() && !e.is_cancelled(),
                };
                if replace {
                    first_error = Some(e);
                } else {
                    warn!("Additional worker failure: {}", e);
                }
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
