//! Wireguard tunnel control loop
//!
//! Owns the encrypted network interface: computes the deterministic
//! overlay address, brings the link up, keeps the device's peer list
//! aligned with the network state store, and tears the link down on
//! exit. All kernel programming goes through the [`driver::NetDriver`]
//! trait so tests can substitute a recording driver.

pub mod addr;
pub mod control;
pub mod driver;
pub mod error;

pub use addr::overlay_address;
pub use control::WgControl;
pub use driver::{DeviceConfig, NetDriver, PeerConfig, WgCli};
pub use error::WgError;
