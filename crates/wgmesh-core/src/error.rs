//! Core error types

use thiserror::Error;

/// Errors from the shared data model.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload (de)serialization failure
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Peer id bytes in a payload do not parse
    #[error("invalid peer id in payload")]
    InvalidPeerId,
}
