//! depotsync workspace root
//!
//! Re-exports the depotsync crates and hosts the cross-crate integration
//! tests under `tests/`.

pub use depot_pool as pool;
pub use depot_proto as proto;
pub use depot_store as store;
pub use depot_sync as sync;

pub use depot_pool::{EndpointPool, PoolConfig};
pub use depot_sync::{DepotRequest, SyncConfig, SyncError, SyncOrchestrator, SyncReport};
