//! In-memory collaborators for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use depot_proto::{
    AppId, ChunkDescriptor, ChunkId, ContentHash, ContentTransport, DepotId, DepotKey, Endpoint,
    EndpointKind, FatalReason, FetchOutcome, FileDescriptor, FileFlags, ManifestId,
    ManifestSnapshot, ManifestTicket, SessionProvider,
};
use tokio_util::sync::CancellationToken;

pub(crate) struct FakeSession {
    endpoints: Vec<Endpoint>,
    connected: AtomicBool,
    pub ticket_requests: AtomicUsize,
}

impl FakeSession {
    /// `count` CDN endpoints; the most loaded one can also relay
    pub fn with_endpoints(count: usize) -> Self {
        let endpoints = (0..count)
            .map(|i| {
                let mut endpoint = Endpoint::new(format!("cdn-{}.test", i), 80, EndpointKind::Cdn);
                endpoint.weighted_load = i as f32;
                endpoint.relay_capable = i + 1 == count;
                endpoint
            })
            .collect();
        Self {
            endpoints,
            connected: AtomicBool::new(true),
            ticket_requests: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionProvider for FakeSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn manifest_ticket(
        &self,
        _app_id: AppId,
        _depot_id: DepotId,
        _manifest_id: ManifestId,
        _branch: &str,
    ) -> depot_proto::Result<ManifestTicket> {
        let n = self.ticket_requests.fetch_add(1, Ordering::SeqCst);
        Ok(ManifestTicket(1000 + n as u64))
    }

    async fn depot_key(&self, _app_id: AppId, depot_id: DepotId) -> depot_proto::Result<DepotKey> {
        Ok(DepotKey(Bytes::from(depot_id.to_le_bytes().to_vec())))
    }

    async fn directory_servers(&self, _cell_id: u32) -> depot_proto::Result<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}

/// Serves registered manifests and chunk payloads, with fault injection
#[derive(Default)]
pub(crate) struct FakeTransport {
    manifests: Mutex<HashMap<(DepotId, ManifestId), ManifestSnapshot>>,
    chunks: Mutex<HashMap<ChunkId, Bytes>>,
    chunk_fetches: AtomicUsize,
    manifest_fetches: AtomicUsize,
    fail_next: AtomicUsize,
    corrupt_next: AtomicUsize,
    mislabel_next: AtomicUsize,
    deny: AtomicBool,
    cancel_on_chunk: Mutex<Option<CancellationToken>>,
    tickets_seen: Mutex<Vec<ManifestTicket>>,
    /// Host of the relay passed with each request
    relays_seen: Mutex<Vec<Option<String>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve_manifest(&self, manifest: &ManifestSnapshot, contents: &[Vec<u8>]) {
        for (file, content) in manifest.files.iter().zip(contents) {
            self.serve_file(file, content);
        }
        self.manifests
            .lock()
            .unwrap()
            .insert((manifest.depot_id, manifest.manifest_id), manifest.clone());
    }

    /// Payloads of chunks whose lengths differ are stored zstd-compressed
    pub fn serve_file(&self, file: &FileDescriptor, content: &[u8]) {
        let mut chunks = self.chunks.lock().unwrap();
        for chunk in &file.chunks {
            let data = &content[chunk.offset as usize..chunk.end() as usize];
            let payload = if chunk.compressed_len != chunk.uncompressed_len {
                zstd::encode_all(data, 3).unwrap()
            } else {
                data.to_vec()
            };
            chunks.insert(chunk.id.clone(), Bytes::from(payload));
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn corrupt_next(&self, count: usize) {
        self.corrupt_next.store(count, Ordering::SeqCst);
    }

    /// Answer the next `count` manifest requests with another manifest's id
    pub fn mislabel_next(&self, count: usize) {
        self.mislabel_next.store(count, Ordering::SeqCst);
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

    pub fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub fn tickets_seen(&self) -> Vec<ManifestTicket> {
        self.tickets_seen.lock().unwrap().clone()
    }

    pub fn relays_seen(&self) -> Vec<Option<String>> {
        self.relays_seen.lock().unwrap().clone()
    }

    fn record_relay(&self, relay: Option<&Endpoint>) {
        self.relays_seen
            .lock()
            .unwrap()
            .push(relay.map(|r| r.host.clone()));
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ContentTransport for FakeTransport {
    async fn fetch_manifest(
        &self,
        depot_id: DepotId,
        manifest_id: ManifestId,
        ticket: ManifestTicket,
        _endpoint: &Endpoint,
        _key: &DepotKey,
        relay: Option<&Endpoint>,
    ) -> FetchOutcome<ManifestSnapshot> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        self.tickets_seen.lock().unwrap().push(ticket);
        self.record_relay(relay);
        if self.deny.load(Ordering::SeqCst) {
            return FetchOutcome::FatalFailure(FatalReason::Unauthorized("403".to_string()));
        }
        if Self::take_fault(&self.fail_next) {
            return FetchOutcome::TransientFailure("503".to_string());
        }
        let found = self
            .manifests
            .lock()
            .unwrap()
            .get(&(depot_id, manifest_id))
            .cloned();
        match found {
            Some(mut manifest) => {
                if Self::take_fault(&self.mislabel_next) {
                    manifest.manifest_id = ManifestId(manifest.manifest_id.0 + 1);
                }
                FetchOutcome::Success(manifest)
            }
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
        _endpoint: &Endpoint,
        _key: &DepotKey,
        relay: Option<&Endpoint>,
    ) -> FetchOutcome<Bytes> {
        self.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        self.record_relay(relay);
        let armed = self.cancel_on_chunk.lock().unwrap().take();
        if let Some(token) = armed {
            token.cancel();
        }
        if self.deny.load(Ordering::SeqCst) {
            return FetchOutcome::FatalFailure(FatalReason::Unauthorized("403".to_string()));
        }
        if Self::take_fault(&self.fail_next) {
            return FetchOutcome::TransientFailure("connection reset".to_string());
        }
        let payload = match self.chunks.lock().unwrap().get(&chunk.id) {
            Some(payload) => payload.clone(),
            None => return FetchOutcome::FatalFailure(FatalReason::NotFound(chunk.id.to_hex())),
        };
        if Self::take_fault(&self.corrupt_next) {
            let mut bad = payload.to_vec();
            if let Some(first) = bad.first_mut() {
                *first ^= 0xff;
            }
            return FetchOutcome::Success(Bytes::from(bad));
        }
        FetchOutcome::Success(payload)
    }
}

/// Deterministic bytes for a chunk seed; equal seeds give equal chunks
pub(crate) fn chunk_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_mul(37).wrapping_add((i % 251) as u8))
        .collect()
}

fn build_file(path: &str, chunks: &[(u8, usize)], compress: bool) -> (FileDescriptor, Vec<u8>) {
    let mut content = Vec::new();
    let mut descriptors = Vec::new();
    for &(seed, len) in chunks {
        let data = chunk_bytes(seed, len);
        let compressed_len = if compress {
            zstd::encode_all(&data[..], 3).unwrap().len() as u32
        } else {
            len as u32
        };
        descriptors.push(ChunkDescriptor {
            id: ChunkId::for_content(&data),
            checksum: ContentHash::compute(&data),
            offset: content.len() as u64,
            uncompressed_len: len as u32,
            compressed_len,
        });
        content.extend_from_slice(&data);
    }
    let file = FileDescriptor {
        path: path.to_string(),
        total_size: content.len() as u64,
        chunks: descriptors,
        flags: FileFlags::default(),
        content_hash: ContentHash::compute(&content),
    };
    (file, content)
}

/// A file made of the given `(seed, len)` chunks, laid out back to back
pub(crate) fn chunked_file(path: &str, chunks: &[(u8, usize)]) -> (FileDescriptor, Vec<u8>) {
    build_file(path, chunks, false)
}

/// Like [`chunked_file`] but every chunk travels zstd-compressed
pub(crate) fn compressed_file(path: &str, chunks: &[(u8, usize)]) -> (FileDescriptor, Vec<u8>) {
    build_file(path, chunks, true)
}

pub(crate) fn directory(path: &str) -> FileDescriptor {
    FileDescriptor {
        path: path.to_string(),
        total_size: 0,
        chunks: Vec::new(),
        flags: FileFlags {
            directory: true,
            executable: false,
        },
        content_hash: ContentHash::compute(&[]),
    }
}

/// Manifest plus the full content of each of its files
pub(crate) fn manifest(
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
