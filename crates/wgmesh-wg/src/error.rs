//! Tunnel error types

use thiserror::Error;

/// Errors from the tunnel control loop and the kernel driver.
#[derive(Debug, Error)]
pub enum WgError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] wgmesh_core::ConfigError),

    /// An external command exited non-zero
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// A snapshot entry cannot be turned into a tunnel peer
    #[error("peer {peer} rejected: {reason}")]
    InvalidPeer { peer: String, reason: String },
}
