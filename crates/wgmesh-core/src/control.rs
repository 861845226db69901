//! Capability seams between the components
//!
//! The overlay transport needs two things from the tunnel control loop
//! (read the local state to announce, poke it after address updates) and
//! one thing from the configuration (persist the self-healing bootstrap
//! list). Narrow traits keep the dependency graph acyclic: the transport
//! depends on these, never on the implementations.

use crate::announce::WireguardState;
use crate::config::ConfigError;

/// What the overlay transport may ask of the tunnel control loop.
pub trait TunnelControl: Send + Sync {
    /// Current local tunnel state, as it should be announced.
    fn announce_info(&self) -> WireguardState;

    /// Request a peer-sync round. Must never block; bursts collapse into
    /// at most one pending update.
    fn force_update(&self);
}

/// Persistence hook for the self-healing bootstrap list.
pub trait BootstrapStore: Send + Sync {
    fn save_bootstrap(&self, peers: Vec<String>) -> Result<(), ConfigError>;
}
