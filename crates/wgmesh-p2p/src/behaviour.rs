//! Swarm construction
//!
//! The overlay fabric is a private network: every TCP connection runs
//! the pre-shared-key handshake before noise and yamux, so a peer with
//! the wrong PSK never completes a connection. On top of that sit
//! gossipsub with peer exchange (the announcement plane), identify
//! (address learning) and UPnP (best-effort port mapping).

use libp2p::{
    core::{transport::Transport, upgrade},
    gossipsub, identify,
    identity::Keypair,
    noise,
    pnet::{PnetConfig, PreSharedKey},
    swarm::NetworkBehaviour,
    tcp, upnp, yamux, Swarm, SwarmBuilder,
};
use std::time::Duration;

use crate::error::P2pError;

/// The gossip topic every announcement travels on.
pub const ANNOUNCE_TOPIC: &str = "w2w:announces";

/// Identify protocol tag for this mesh.
const PROTOCOL_VERSION: &str = "/wgmesh/1.0.0";

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(NetworkBehaviour)]
pub struct MeshBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub upnp: upnp::tokio::Behaviour,
}

pub(crate) fn build_swarm(
    keypair: Keypair,
    psk: PreSharedKey,
) -> Result<Swarm<MeshBehaviour>, P2pError> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_other_transport(|key| {
            let noise_config = noise::Config::new(key)?;
            let yamux_config = yamux::Config::default();
            let base = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
            let transport = base
                .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
                .upgrade(upgrade::Version::V1Lazy)
                .authenticate(noise_config)
                .multiplex(yamux_config);
            Ok(transport)
        })
        .map_err(|e| P2pError::Transport(e.to_string()))?
        .with_dns()
        .map_err(|e| P2pError::Transport(e.to_string()))?
        .with_behaviour(|key| {
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .validation_mode(gossipsub::ValidationMode::Strict)
                // small trusted network: let new subscribers learn the
                // topic membership from whoever they joined through
                .do_px()
                .build()?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )?;

            let identify = identify::Behaviour::new(identify::Config::new(
                PROTOCOL_VERSION.to_string(),
                key.public(),
            ));

            let upnp = upnp::tokio::Behaviour::default();

            Ok(MeshBehaviour {
                gossipsub,
                identify,
                upnp,
            })
        })
        .map_err(|e| P2pError::Transport(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    Ok(swarm)
}
