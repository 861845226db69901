//! Overlay transport error types

use thiserror::Error;

/// Errors from the overlay transport. Everything here is fatal to the
/// component; transient connect and publish failures are logged instead.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("config error: {0}")]
    Config(#[from] wgmesh_core::ConfigError),

    #[error("transport setup failed: {0}")]
    Transport(String),

    #[error("cannot listen on overlay address: {0}")]
    Listen(String),

    #[error("cannot subscribe to the announce topic: {0}")]
    Subscribe(String),

    /// An announcement that does not decode: the mesh speaks another
    /// protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),
}
