//! Network state store
//!
//! The single shared table of everything the mesh knows about its peers.
//! The overlay transport writes announcements and observed transport
//! addresses into it; the tunnel control loop reads immutable snapshots
//! out of it. Records are created on the first valid announcement and
//! never evicted: peer absence shows up as a stale `last_seen`, not a
//! missing entry.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use libp2p_identity::PeerId;
use multiaddr::{Multiaddr, Protocol};
use parking_lot::RwLock;
use tracing::debug;

use crate::announce::{Announce, WireguardState};

/// One known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Last valid announcement received from this peer.
    pub last_announce: Announce,
    /// Transport address the overlay currently uses to reach the peer.
    pub observed_addr: Option<Multiaddr>,
    /// When the last announcement arrived.
    pub last_seen: Instant,
}

/// Flattened snapshot entry handed to the tunnel control loop.
#[derive(Debug, Clone)]
pub struct Info {
    pub peer_id: PeerId,
    /// Plain IP extracted from the observed multiaddr.
    pub addr: String,
    pub wireguard: WireguardState,
}

/// Concurrent peer table fed by the overlay transport.
pub struct NetworkState {
    local: PeerId,
    nodes: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl NetworkState {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Ingest one announcement. Incomplete payloads and self-announcements
    /// are dropped; a previously observed transport address survives the
    /// upsert.
    pub fn on_announce(&self, sender: PeerId, announce: Announce) {
        if sender == self.local {
            return;
        }
        if !announce.wireguard.is_valid() {
            debug!("dropping announce from {sender}: incomplete wireguard state");
            return;
        }

        let now = Instant::now();
        let mut nodes = self.nodes.write();
        nodes
            .entry(sender)
            .and_modify(|rec| {
                rec.last_announce = announce.clone();
                rec.last_seen = now;
            })
            .or_insert_with(|| PeerRecord {
                last_announce: announce,
                observed_addr: None,
                last_seen: now,
            });
    }

    /// Record the transport addresses currently in use. Peers we have no
    /// announcement for yet are skipped (one will follow shortly); peers
    /// missing from the map keep their previous address so the tunnel
    /// holds on to its last known endpoint.
    pub fn update_addrs(&self, addrs: HashMap<PeerId, Multiaddr>) {
        let mut nodes = self.nodes.write();
        for (peer, addr) in addrs {
            if let Some(rec) = nodes.get_mut(&peer) {
                rec.observed_addr = Some(addr);
            }
        }
    }

    /// Point-in-time copy of every peer that has both a valid announcement
    /// and a transport address carrying a plain IP.
    pub fn snapshot(&self) -> Vec<Info> {
        let nodes = self.nodes.read();
        nodes
            .iter()
            .filter_map(|(peer_id, rec)| {
                let ip = rec.observed_addr.as_ref().and_then(multiaddr_ip)?;
                Some(Info {
                    peer_id: *peer_id,
                    addr: ip.to_string(),
                    wireguard: rec.last_announce.wireguard.clone(),
                })
            })
            .collect()
    }

    /// Number of peers currently known.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

/// First IP component of a multiaddr, if any.
fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}
