//! Depot content model for depotsync
//!
//! This crate defines the types shared by every other depotsync crate:
//! - Identifiers for apps, depots and manifests
//! - Chunk and file descriptors as listed by a depot manifest
//! - Delivery endpoints handed out by the endpoint pool
//! - The `SessionProvider` and `ContentTransport` collaborator traits
//!
//! The wire protocol and manifest binary format live behind
//! `ContentTransport`; nothing here knows how bytes travel.

pub mod endpoint;
pub mod errors;
pub mod hash;
pub mod manifest;
pub mod transport;

pub use endpoint::{Endpoint, EndpointKind};
pub use errors::{ProtoError, Result};
pub use hash::{ChunkId, ContentHash};
pub use manifest::{
    AppId, ChunkDescriptor, DepotId, FileDescriptor, FileFlags, ManifestId, ManifestSnapshot,
    UgcId,
};
pub use transport::{
    ContentTransport, DepotKey, FatalReason, FetchOutcome, ManifestTicket, SessionProvider,
};
