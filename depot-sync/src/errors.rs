//! Error types for sync operations

use std::path::PathBuf;
use thiserror::Error;

use depot_pool::PoolError;
use depot_proto::{AppId, DepotId, FatalReason, ProtoError};
use depot_store::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Manifest error: {0}")]
    Proto(#[from] ProtoError),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Content endpoints exhausted")]
    EndpointsExhausted,

    #[error("Access denied: {0}")]
    Unauthorized(String),

    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Filesystem error at {}: {reason}", path.display())]
    Filesystem { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Failed to sync depot {depot_id} of app {app_id}: {source}")]
    Depot {
        app_id: AppId,
        depot_id: DepotId,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Wrap an io error with the path it concerns
    pub fn filesystem(path: impl Into<PathBuf>, action: &str, err: std::io::Error) -> Self {
        SyncError::Filesystem {
            path: path.into(),
            reason: format!("{}: {}", action, err),
        }
    }

    /// Attach depot context, leaving cancellation distinguishable from failure
    pub fn for_depot(self, app_id: AppId, depot_id: DepotId) -> Self {
        match self {
            SyncError::Cancelled | SyncError::Depot { .. } => self,
            other => SyncError::Depot {
                app_id,
                depot_id,
                source: Box::new(other),
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled => true,
            SyncError::Depot { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Innermost error, skipping depot context
    pub fn root_cause(&self) -> &SyncError {
        match self {
            SyncError::Depot { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<PoolError> for SyncError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted => SyncError::EndpointsExhausted,
            PoolError::Cancelled => SyncError::Cancelled,
        }
    }
}

impl From<FatalReason> for SyncError {
    fn from(reason: FatalReason) -> Self {
        match reason {
            FatalReason::Unauthorized(msg) => SyncError::Unauthorized(msg),
            FatalReason::NotFound(msg) => SyncError::NotFound(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
