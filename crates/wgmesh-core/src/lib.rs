//! Shared data model for the wgmesh control plane
//!
//! This crate holds everything the overlay transport and the tunnel
//! control loop exchange: the announcement wire format, the network
//! state store that fuses announcements with live transport addresses,
//! the persistent configuration, and the narrow capability traits that
//! keep the component graph acyclic.

pub mod announce;
pub mod config;
pub mod control;
pub mod error;
pub mod state;

pub use announce::{AddrInfo, Announce, WireguardState};
pub use config::{Config, ConfigError, ConfigFile, P2pConfig, WireguardConfig};
pub use control::{BootstrapStore, TunnelControl};
pub use error::CoreError;
pub use state::{Info, NetworkState, PeerRecord};
