//! Peer address book
//!
//! Accumulates every transport address we learn for a peer, from the
//! configured bootstrap list, announcements, live connections, and
//! identify. The whole book renders as a sorted list of
//! `<multiaddr>/p2p/<peer-id>` strings; persisting that list back into
//! the configuration is what makes the bootstrap list self-healing.

use std::collections::{HashMap, HashSet};

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

pub(crate) struct AddrBook {
    local: PeerId,
    peers: HashMap<PeerId, HashSet<Multiaddr>>,
}

impl AddrBook {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    /// Remember one address for a peer. The local peer and empty
    /// addresses are ignored; a trailing `/p2p/` suffix is stripped so
    /// entries stay dialable bases.
    pub fn add(&mut self, peer: PeerId, addr: Multiaddr) {
        if peer == self.local {
            return;
        }
        let addr = strip_p2p(addr);
        if addr.is_empty() {
            return;
        }
        self.peers.entry(peer).or_default().insert(addr);
    }

    /// Every known peer with its addresses; the local peer never appears.
    pub fn peers(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        self.peers
            .iter()
            .map(|(peer, addrs)| (*peer, addrs.iter().cloned().collect()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// The sorted full-address list that gets persisted as the bootstrap
    /// list. Identical membership always renders identically, so callers
    /// can compare lists to detect change.
    pub fn bootstrap_list(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .peers
            .iter()
            .flat_map(|(peer, addrs)| {
                addrs
                    .iter()
                    .map(move |addr| addr.clone().with(Protocol::P2p(*peer)).to_string())
            })
            .collect();
        entries.sort();
        entries
    }
}

/// Drop any trailing `/p2p/` component.
fn strip_p2p(mut addr: Multiaddr) -> Multiaddr {
    while matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.pop();
    }
    addr
}
