use thiserror::Error;

use crate::storage::StorageError;

/// Errors surfaced by broker operations.
///
/// Per-frame protocol errors are answered inline on the offending
/// connection and never escalate past the frame that caused them.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("authentication failed")]
    Auth,

    #[error("session is suspended")]
    Suspended,

    #[error("session not found")]
    NotFound,

    #[error("session already exists")]
    AlreadyExists,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
