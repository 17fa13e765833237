//! Collaborator interfaces consumed by the sync core
//!
//! `SessionProvider` owns authentication and connection state; the core only
//! issues point-to-point requests against it. `ContentTransport` speaks the
//! wire protocol to a single endpoint and reports the result as a
//! `FetchOutcome` instead of an error so that retry decisions stay explicit.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::endpoint::Endpoint;
use crate::errors::Result;
use crate::manifest::{AppId, ChunkDescriptor, DepotId, ManifestId, ManifestSnapshot};

/// Short-lived code authorizing one manifest download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestTicket(pub u64);

/// Decryption key for a depot's content
#[derive(Clone, PartialEq, Eq)]
pub struct DepotKey(pub Bytes);

impl fmt::Debug for DepotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DepotKey(<{} bytes>)", self.0.len())
    }
}

/// Why a fetch must not be retried
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// The session may not access this content (401/403 class)
    Unauthorized(String),
    /// The content does not exist on any endpoint
    NotFound(String),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            FatalReason::NotFound(msg) => write!(f, "not found: {}", msg),
        }
    }
}

/// Result of a single request against one endpoint
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    Success(T),
    /// The endpoint misbehaved; retry elsewhere
    TransientFailure(String),
    /// Retrying cannot help
    FatalFailure(FatalReason),
}

/// Authenticated session with the content service
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Whether the session currently holds a live connection
    fn is_connected(&self) -> bool;

    /// Request a manifest access ticket
    async fn manifest_ticket(
        &self,
        app_id: AppId,
        depot_id: DepotId,
        manifest_id: ManifestId,
        branch: &str,
    ) -> Result<ManifestTicket>;

    /// Request the decryption key of a depot
    async fn depot_key(&self, app_id: AppId, depot_id: DepotId) -> Result<DepotKey>;

    /// Query the content directory for delivery endpoints near `cell_id`
    async fn directory_servers(&self, cell_id: u32) -> Result<Vec<Endpoint>>;
}

/// Opaque remote protocol for manifests and chunks
#[async_trait]
pub trait ContentTransport: Send + Sync {
    async fn fetch_manifest(
        &self,
        depot_id: DepotId,
        manifest_id: ManifestId,
        ticket: ManifestTicket,
        endpoint: &Endpoint,
        key: &DepotKey,
        relay: Option<&Endpoint>,
    ) -> FetchOutcome<ManifestSnapshot>;

    /// Fetch the raw payload of one chunk.
    ///
    /// The payload is zstd-compressed whenever the descriptor's compressed
    /// length differs from its uncompressed length.
    async fn fetch_chunk(
        &self,
        depot_id: DepotId,
        chunk: &ChunkDescriptor,
        endpoint: &Endpoint,
        key: &DepotKey,
        relay: Option<&Endpoint>,
    ) -> FetchOutcome<Bytes>;
}
