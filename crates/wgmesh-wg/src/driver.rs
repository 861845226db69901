//! Kernel programming driver
//!
//! Everything that touches the host network stack goes through the
//! [`NetDriver`] trait: link management via `ip(8)` and wireguard device
//! configuration via `wg(8)`. The control loop never shells out
//! directly, and tests substitute a recording driver.

use std::net::{Ipv6Addr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv6Net;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::WgError;

/// Desired wireguard device configuration for one sync round.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Device private key, base64.
    pub private_key: String,
    pub listen_port: u16,
    /// When false, peers already installed on the device survive the
    /// round even if absent from `peers`.
    pub replace_peers: bool,
    pub peers: Vec<PeerConfig>,
}

/// One tunnel peer entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    /// Peer public key, base64.
    pub public_key: String,
    pub endpoint: SocketAddr,
    /// Exact overlay addresses routed to this peer.
    pub allowed_ips: Vec<Ipv6Net>,
    /// Replace (rather than extend) the peer's installed allowed-ips.
    pub replace_allowed_ips: bool,
    pub persistent_keepalive: Option<Duration>,
}

/// The kernel-programming collaborator.
#[async_trait]
pub trait NetDriver: Send + Sync {
    /// Create the wireguard link if it does not already exist.
    async fn ensure_link(&self, name: &str) -> Result<(), WgError>;

    /// Assign `addr/prefix_len` to the link, replacing a prior assignment
    /// of the same address.
    async fn replace_address(
        &self,
        name: &str,
        addr: Ipv6Addr,
        prefix_len: u8,
    ) -> Result<(), WgError>;

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), WgError>;

    async fn set_up(&self, name: &str) -> Result<(), WgError>;

    /// Install a link-scoped route for `dst`; already present is success.
    async fn ensure_route(&self, name: &str, dst: Ipv6Net) -> Result<(), WgError>;

    async fn delete_link(&self, name: &str) -> Result<(), WgError>;

    /// Probe whether the wireguard device exists.
    async fn device_exists(&self, name: &str) -> Result<bool, WgError>;

    /// Apply a device configuration.
    async fn configure(&self, name: &str, config: DeviceConfig) -> Result<(), WgError>;
}

/// Production driver shelling out to `ip(8)` and `wg(8)`.
///
/// Requires root or CAP_NET_ADMIN.
#[derive(Debug, Default)]
pub struct WgCli;

impl WgCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(program: &str, args: &[&str]) -> Result<String, WgError> {
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(WgError::Command {
                command: format!("{program} {}", args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ip(args: &[&str]) -> Result<String, WgError> {
        Self::run("ip", args).await
    }

    async fn wg(args: &[&str]) -> Result<String, WgError> {
        Self::run("wg", args).await
    }

    /// `wg set <iface> private-key /dev/stdin ...` with the key piped in,
    /// so it never lands on the filesystem or in an argument list.
    async fn wg_set_device(name: &str, config: &DeviceConfig) -> Result<(), WgError> {
        let port = config.listen_port.to_string();
        let mut child = Command::new("wg")
            .args(["set", name, "private-key", "/dev/stdin", "listen-port", port.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(config.private_key.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(WgError::Command {
                command: format!("wg set {name} private-key (stdin) listen-port {port}"),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Peers currently installed on the device, by public key.
    async fn installed_peers(name: &str) -> Result<Vec<String>, WgError> {
        let out = Self::wg(&["show", name, "peers"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn apply_peer(name: &str, peer: &PeerConfig) -> Result<(), WgError> {
        let endpoint = peer.endpoint.to_string();
        let allowed: Vec<String> = peer.allowed_ips.iter().map(|net| net.to_string()).collect();
        let mut allowed = allowed.join(",");

        if !peer.replace_allowed_ips {
            // `wg set ... allowed-ips` always replaces, so extending means
            // merging with what is currently installed.
            let shown = Self::wg(&["show", name, "allowed-ips"]).await?;
            for line in shown.lines() {
                let mut fields = line.split_whitespace();
                if fields.next() == Some(peer.public_key.as_str()) {
                    for existing in fields {
                        if !allowed.split(',').any(|a| a == existing) {
                            allowed.push(',');
                            allowed.push_str(existing);
                        }
                    }
                }
            }
        }

        let keepalive = peer
            .persistent_keepalive
            .map(|interval| interval.as_secs().to_string());

        let mut args = vec!["set", name, "peer", peer.public_key.as_str()];
        if let Some(ref keepalive) = keepalive {
            args.extend(["persistent-keepalive", keepalive.as_str()]);
        }
        args.extend(["endpoint", endpoint.as_str(), "allowed-ips", allowed.as_str()]);

        Self::wg(&args).await?;
        Ok(())
    }
}

#[async_trait]
impl NetDriver for WgCli {
    async fn ensure_link(&self, name: &str) -> Result<(), WgError> {
        match Self::ip(&["link", "add", "dev", name, "type", "wireguard"]).await {
            Ok(_) => Ok(()),
            Err(WgError::Command { ref stderr, .. }) if stderr.contains("File exists") => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn replace_address(
        &self,
        name: &str,
        addr: Ipv6Addr,
        prefix_len: u8,
    ) -> Result<(), WgError> {
        let cidr = format!("{addr}/{prefix_len}");
        Self::ip(&["-6", "address", "replace", cidr.as_str(), "dev", name]).await?;
        Ok(())
    }

    async fn set_mtu(&self, name: &str, mtu: u32) -> Result<(), WgError> {
        let mtu = mtu.to_string();
        Self::ip(&["link", "set", "dev", name, "mtu", mtu.as_str()]).await?;
        Ok(())
    }

    async fn set_up(&self, name: &str) -> Result<(), WgError> {
        Self::ip(&["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn ensure_route(&self, name: &str, dst: Ipv6Net) -> Result<(), WgError> {
        let dst = dst.to_string();
        Self::ip(&["-6", "route", "replace", dst.as_str(), "dev", name, "scope", "link"]).await?;
        Ok(())
    }

    async fn delete_link(&self, name: &str) -> Result<(), WgError> {
        Self::ip(&["link", "del", "dev", name]).await?;
        Ok(())
    }

    async fn device_exists(&self, name: &str) -> Result<bool, WgError> {
        match Self::wg(&["show", name]).await {
            Ok(_) => Ok(true),
            Err(WgError::Command { ref stderr, .. }) if stderr.contains("No such device") => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn configure(&self, name: &str, config: DeviceConfig) -> Result<(), WgError> {
        Self::wg_set_device(name, &config).await?;

        if config.replace_peers {
            let wanted: Vec<&str> = config.peers.iter().map(|p| p.public_key.as_str()).collect();
            for installed in Self::installed_peers(name).await? {
                if !wanted.contains(&installed.as_str()) {
                    debug!("removing stale peer {installed} from {name}");
                    Self::wg(&["set", name, "peer", &installed, "remove"]).await?;
                }
            }
        }

        for peer in &config.peers {
            Self::apply_peer(name, peer).await?;
        }

        Ok(())
    }
}
