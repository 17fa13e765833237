use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Content endpoints exhausted")]
    Exhausted,

    #[error("Endpoint acquisition cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PoolError>;
