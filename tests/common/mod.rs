#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use depotsync::proto::{
    AppId, ChunkDescriptor, ChunkId, ContentHash, ContentTransport, DepotId, DepotKey, Endpoint,
    EndpointKind, FatalReason, FetchOutcome, FileDescriptor, FileFlags, ManifestId,
    ManifestSnapshot, ManifestTicket, SessionProvider,
};
use depotsync::{EndpointPool, PoolConfig, SyncConfig, SyncOrchestrator};

pub const APP: AppId = 730;

static TRACING_INIT: Once = Once::new();

/// Install a test subscriber once per process; honours `RUST_LOG`
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Session whose directory lists a fixed set of CDN endpoints
pub struct TestSession {
    endpoints: Mutex<Vec<Endpoint>>,
    connected: AtomicBool,
    pub ticket_requests: AtomicUsize,
}

impl TestSession {
    pub fn new(endpoint_count: usize) -> Arc<Self> {
        let endpoints = (0..endpoint_count)
            .map(|i| {
                let mut endpoint = Endpoint::new(format!("edge-{}.cdn.test", i), 443, EndpointKind::Cdn);
                endpoint.weighted_load = (i * 10) as f32;
                endpoint
            })
            .collect();
        Arc::new(Self {
            endpoints: Mutex::new(endpoints),
            connected: AtomicBool::new(true),
            ticket_requests: AtomicUsize::new(0),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionProvider for TestSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn manifest_ticket(
        &self,
        _app_id: AppId,
        _depot_id: DepotId,
        _manifest_id: ManifestId,
        _branch: &str,
    ) -> depotsync::proto::Result<ManifestTicket> {
        let n = self.ticket_requests.fetch_add(1, Ordering::SeqCst);
        Ok(ManifestTicket(n as u64))
    }

    async fn depot_key(
        &self,
        _app_id: AppId,
        depot_id: DepotId,
    ) -> depotsync::proto::Result<DepotKey> {
        Ok(DepotKey(Bytes::from(depot_id.to_be_bytes().to_vec())))
    }

    async fn directory_servers(&self, _cell_id: u32) -> depotsync::proto::Result<Vec<Endpoint>> {
        Ok(self.endpoints.lock().unwrap().clone())
    }
}

/// In-memory content server with per-endpoint fault injection
#[derive(Default)]
pub struct TestTransport {
    manifests: Mutex<HashMap<(DepotId, ManifestId), ManifestSnapshot>>,
    chunks: Mutex<HashMap<ChunkId, Bytes>>,
    pub chunk_fetches: AtomicUsize,
    pub manifest_fetches: AtomicUsize,
    /// Hosts that answer every chunk request with a transient failure
    failing_hosts: Mutex<Vec<String>>,
    /// Hosts that served at least one chunk successfully
    serving_hosts: Mutex<Vec<String>>,
    deny: AtomicBool,
    cancel_on_chunk: Mutex<Option<CancellationToken>>,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, manifest: &ManifestSnapshot, contents: &[Vec<u8>]) {
        let mut chunks = self.chunks.lock().unwrap();
        for (file, content) in manifest.files.iter().zip(contents) {
            for chunk in &file.chunks {
                let data = &content[chunk.offset as usize..chunk.end() as usize];
                chunks.insert(chunk.id.clone(), Bytes::copy_from_slice(data));
            }
        }
        self.manifests
            .lock()
            .unwrap()
            .insert((manifest.depot_id, manifest.manifest_id), manifest.clone());
    }

    pub fn fail_host(&self, host: &str) {
        self.failing_hosts.lock().unwrap().push(host.to_string());
    }

    pub fn serving_hosts(&self) -> Vec<String> {
        self.serving_hosts.lock().unwrap().clone()
    }

    pub fn deny_all(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn cancel_on_chunk(&self, token: CancellationToken) {
        *self.cancel_on_chunk.lock().unwrap() = Some(token);
    }

    pub fn chunk_fetches(&self) -> usize {
        self.chunk_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentTransport for TestTransport {
    async fn fetch_manifest(
        &self,
        depot_id: DepotId,
        manifest_id: ManifestId,
        _ticket: ManifestTicket,
        _endpoint: &Endpoint,
        _key: &DepotKey,
        _relay: Option<&Endpoint>,
    ) -> FetchOutcome<ManifestSnapshot> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        match self.manifests.lock().unwrap().get(&(depot_id, manifest_id)) {
            Some(manifest) => FetchOutcome::Success(manifest.clone()),
            None => FetchOutcome::FatalFailure(FatalReason::NotFound(format!(
                "manifest {} of depot {}",
                manifest_id, depot_id
            ))),
        }
    }

    async fn fetch_chunk(
        &self,
        _depot_id: DepotId,
        chunk: &ChunkDescriptor,
        endpoint: &Endpoint,
        _key: &DepotKey,
        _relay: Option<&Endpoint>,
    ) -> FetchOutcome<Bytes> {
        self.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        let armed = self.cancel_on_chunk.lock().unwrap().take();
        if let Some(token) = armed {
            token.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return FetchOutcome::FatalFailure(FatalReason::Unauthorized(
                "access denied".to_string(),
            ));
        }
        if self.failing_hosts.lock().unwrap().contains(&endpoint.host) {
            return FetchOutcome::TransientFailure("HTTP 503".to_string());
        }
        match self.chunks.lock().unwrap().get(&chunk.id) {
            Some(payload) => {
                self.serving_hosts.lock().unwrap().push(endpoint.host.clone());
                FetchOutcome::Success(payload.clone())
            }
            None => FetchOutcome::FatalFailure(FatalReason::NotFound(chunk.id.to_hex())),
        }
    }
}

/// Deterministic chunk content; equal seeds and lengths give equal chunks
pub fn chunk_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(13).wrapping_add((i % 241) as u8) ^ 0x5a)
        .collect()
}

/// A file of back-to-back chunks given as `(seed, len)` pairs
pub fn file(path: &str, chunks: &[(u8, usize)]) -> (FileDescriptor, Vec<u8>) {
    let mut content = Vec::new();
    let mut descriptors = Vec::new();
    for &(seed, len) in chunks {
        let data = chunk_bytes(seed, len);
        descriptors.push(ChunkDescriptor {
            id: ChunkId::for_content(&data),
            checksum: ContentHash::compute(&data),
            offset: content.len() as u64,
            uncompressed_len: len as u32,
            compressed_len: len as u32,
        });
        content.extend_from_slice(&data);
    }
    let descriptor = FileDescriptor {
        path: path.to_string(),
        total_size: content.len() as u64,
        chunks: descriptors,
        flags: FileFlags::default(),
        content_hash: ContentHash::compute(&content),
    };
    (descriptor, content)
}

pub fn manifest(
    depot_id: DepotId,
    manifest_id: u64,
    files: Vec<(FileDescriptor, Vec<u8>)>,
) -> (ManifestSnapshot, Vec<Vec<u8>>) {
    let (descriptors, contents): (Vec<_>, Vec<_>) = files.into_iter().unzip();
    (
        ManifestSnapshot::new(depot_id, ManifestId(manifest_id), descriptors),
        contents,
    )
}

/// An install tree wired to a test session, transport and endpoint pool
pub struct TestInstall {
    pub temp_dir: TempDir,
    pub session: Arc<TestSession>,
    pub transport: Arc<TestTransport>,
    pub pool: Arc<EndpointPool>,
}

impl TestInstall {
    pub fn new(endpoint_count: usize) -> Result<Self> {
        init_tracing();
        let session = TestSession::new(endpoint_count);
        let pool = Arc::new(EndpointPool::start(session.clone(), APP, fast_pool_config()));
        Ok(Self {
            temp_dir: TempDir::new()?,
            session,
            transport: TestTransport::new(),
            pool,
        })
    }

    pub fn install_dir(&self) -> PathBuf {
        self.temp_dir.path().join("install")
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.install_dir().join(relative)
    }

    pub fn config(&self) -> SyncConfig {
        let mut config = SyncConfig::new(self.install_dir());
        config.max_downloads = 4;
        config
    }

    pub async fn orchestrator(&self) -> Result<SyncOrchestrator> {
        self.orchestrator_with(self.config()).await
    }

    pub async fn orchestrator_with(&self, config: SyncConfig) -> Result<SyncOrchestrator> {
        Ok(SyncOrchestrator::new(
            config,
            self.session.clone(),
            self.transport.clone(),
            self.pool.clone(),
        )
        .await?)
    }
}

pub fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        poll_interval: Duration::from_millis(10),
        disconnect_grace: Duration::from_millis(50),
        ..Default::default()
    }
}
