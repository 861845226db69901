//! Announcement wire format
//!
//! A single broadcast stating a node's presence: its reachable transport
//! addresses plus the key material needed to install it as a tunnel peer.
//! Peer ids and multiaddrs travel as raw bytes so the payload stays
//! self-contained; typed accessors convert at the edges.

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Tunnel-side state advertised by a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireguardState {
    /// Wireguard public key, base64.
    pub public_key: String,
    /// Overlay address the advertiser selected for itself.
    pub selected_addr: String,
    /// Wireguard listen port.
    pub port: u16,
}

impl WireguardState {
    /// A payload is usable only when all three fields are populated.
    pub fn is_valid(&self) -> bool {
        !self.public_key.is_empty() && !self.selected_addr.is_empty() && self.port != 0
    }
}

/// The advertiser's identity and reachable transport addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrInfo {
    peer_id: Vec<u8>,
    addrs: Vec<Vec<u8>>,
}

impl AddrInfo {
    pub fn new(peer_id: &PeerId, addrs: &[Multiaddr]) -> Self {
        Self {
            peer_id: peer_id.to_bytes(),
            addrs: addrs.iter().map(|a| a.to_vec()).collect(),
        }
    }

    /// Advertised peer id; fails on a corrupt payload.
    pub fn peer_id(&self) -> Result<PeerId, CoreError> {
        PeerId::from_bytes(&self.peer_id).map_err(|_| CoreError::InvalidPeerId)
    }

    /// Advertised addresses, skipping any that do not parse.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .filter_map(|raw| Multiaddr::try_from(raw.clone()).ok())
            .collect()
    }
}

/// One presence broadcast on the announcement topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub addr_info: AddrInfo,
    pub wireguard: WireguardState,
}

impl Announce {
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        Ok(bincode::deserialize(data)?)
    }
}
