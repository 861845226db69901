//! Tunnel control loop
//!
//! Owns the wireguard interface for the lifetime of the process: brings
//! it up, keeps the device's peer set aligned with the network state
//! store, and tears it down on exit. The overlay transport reaches it
//! only through the `TunnelControl` capability.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::Ipv6Net;
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use wgmesh_core::{Config, Info, NetworkState, TunnelControl, WireguardState};

use crate::addr::overlay_address;
use crate::driver::{DeviceConfig, NetDriver, PeerConfig};
use crate::error::WgError;

const PEER_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
// TODO: make the MTU configurable
const TUNNEL_MTU: u32 = 1420;

/// The tunnel control loop component.
pub struct WgControl {
    iface: String,
    listen_port: u16,
    private_key: String,
    public_key: String,
    overlay_addr: Ipv6Addr,
    overlay_prefix: Ipv6Net,
    persistent_keepalive: Option<Duration>,
    state: Arc<NetworkState>,
    driver: Arc<dyn NetDriver>,
    update: Notify,
}

impl WgControl {
    pub fn new(
        cfg: &Config,
        state: Arc<NetworkState>,
        driver: Arc<dyn NetDriver>,
    ) -> Result<Self, WgError> {
        let wg = &cfg.wireguard;

        let secret = wg.load_private_key()?;
        let public = x25519_dalek::PublicKey::from(&secret);
        let overlay_prefix = wg.overlay_prefix()?;
        let overlay_addr = overlay_address(&overlay_prefix, &wg.node_name)?;

        info!("assigned overlay address {overlay_addr}");

        Ok(Self {
            iface: wg.interface.clone(),
            listen_port: wg.listen_port,
            private_key: wg.private_key.clone(),
            public_key: BASE64.encode(public.as_bytes()),
            overlay_addr,
            overlay_prefix,
            persistent_keepalive: wg.persistent_keepalive(),
            state,
            driver,
            update: Notify::new(),
        })
    }

    /// The overlay address this node answers on inside the mesh.
    pub fn overlay_addr(&self) -> Ipv6Addr {
        self.overlay_addr
    }

    /// Run until cancelled or the first fatal error. The interface is
    /// torn down on the way out no matter how the loop ends.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WgError> {
        self.interface_up().await?;

        let result = self.run_loop(&cancel).await;

        match self.teardown().await {
            Ok(()) => result,
            Err(err) => {
                error!("tunnel teardown failed, host interface state is inconsistent: {err}");
                result.and(Err(err))
            }
        }
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> Result<(), WgError> {
        let mut ticker = time::interval_at(
            time::Instant::now() + PEER_UPDATE_INTERVAL,
            PEER_UPDATE_INTERVAL,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("tunnel control loop stopping");
                    return Ok(());
                }
                _ = self.update.notified() => {
                    self.update_peers().await?;
                }
                _ = ticker.tick() => {
                    self.interface_up().await?;
                }
            }
        }
    }

    /// Bring the interface to its desired state. Safe to repeat; repairs
    /// whatever something external may have changed.
    async fn interface_up(&self) -> Result<(), WgError> {
        debug!("interface bring-up for {}", self.iface);

        self.driver.ensure_link(&self.iface).await?;
        self.driver
            .replace_address(&self.iface, self.overlay_addr, 128)
            .await?;
        self.driver.set_mtu(&self.iface, TUNNEL_MTU).await?;
        self.driver.set_up(&self.iface).await?;
        self.driver
            .ensure_route(&self.iface, self.overlay_prefix)
            .await?;

        Ok(())
    }

    /// One peer-sync round: translate the current snapshot into a device
    /// configuration. Peers installed earlier survive the round so
    /// connectivity holds while the overlay transport is flapping.
    async fn update_peers(&self) -> Result<(), WgError> {
        let nodes = self.state.snapshot();
        let peers = self.peer_configs(&nodes)?;

        debug!("applying {} tunnel peers to {}", peers.len(), self.iface);

        self.driver
            .configure(
                &self.iface,
                DeviceConfig {
                    private_key: self.private_key.clone(),
                    listen_port: self.listen_port,
                    replace_peers: false,
                    peers,
                },
            )
            .await
    }

    fn peer_configs(&self, nodes: &[Info]) -> Result<Vec<PeerConfig>, WgError> {
        let mut peers = Vec::with_capacity(nodes.len());

        for node in nodes {
            let announced = &node.wireguard;

            let key_ok = BASE64
                .decode(&announced.public_key)
                .map(|raw| raw.len() == 32)
                .unwrap_or(false);
            if !key_ok {
                return Err(WgError::InvalidPeer {
                    peer: node.peer_id.to_string(),
                    reason: "unparseable public key".to_string(),
                });
            }

            let selected: Ipv6Addr =
                announced
                    .selected_addr
                    .parse()
                    .map_err(|_| WgError::InvalidPeer {
                        peer: node.peer_id.to_string(),
                        reason: format!("invalid overlay address {}", announced.selected_addr),
                    })?;

            let endpoint_ip: IpAddr = node.addr.parse().map_err(|_| WgError::InvalidPeer {
                peer: node.peer_id.to_string(),
                reason: format!("invalid endpoint address {}", node.addr),
            })?;

            peers.push(PeerConfig {
                public_key: announced.public_key.clone(),
                endpoint: SocketAddr::new(endpoint_ip, announced.port),
                allowed_ips: vec![Ipv6Net::from(selected)],
                replace_allowed_ips: true,
                persistent_keepalive: self.persistent_keepalive,
            });
        }

        Ok(peers)
    }

    async fn teardown(&self) -> Result<(), WgError> {
        if !self.driver.device_exists(&self.iface).await? {
            return Ok(());
        }
        self.driver.delete_link(&self.iface).await
    }
}

impl TunnelControl for WgControl {
    fn announce_info(&self) -> WireguardState {
        WireguardState {
            public_key: self.public_key.clone(),
            selected_addr: self.overlay_addr.to_string(),
            port: self.listen_port,
        }
    }

    fn force_update(&self) {
        self.update.notify_one();
    }
}
