//! Error types for the depot data model

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid path in manifest: {0}")]
    InvalidPath(String),

    #[error("Invalid chunk layout for {path}: {reason}")]
    InvalidLayout { path: String, reason: String },

    #[error("Access denied: {0}")]
    Unauthorized(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Session is not connected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, ProtoError>;
