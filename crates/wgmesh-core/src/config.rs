//! Persistent configuration
//!
//! TOML file with one section per component. Any value missing on load is
//! generated or defaulted and the file is rewritten with mode 0600, so a
//! node can start from an empty file and end up with a complete identity.
//! Key-generation failures are fatal.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::Ipv6Net;
use libp2p_identity::{Keypair, PeerId};
use multiaddr::{Multiaddr, Protocol};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::control::BootstrapStore;

pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/10042";
pub const DEFAULT_ANNOUNCE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_WG_INTERFACE: &str = "wesh0";
pub const DEFAULT_WG_LISTEN_PORT: u16 = 10043;
pub const DEFAULT_WG_NETWORK_RANGE: &str = "fd6d:142e:65e7:4cc1::/64";
pub const DEFAULT_WG_KEEPALIVE_SECS: u64 = 60;

/// Configuration errors; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// On-disk configuration, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub p2p: P2pConfig,
    pub wireguard: WireguardConfig,
}

/// Overlay transport settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Mesh pre-shared key, base64 of 32 random bytes.
    pub psk: String,
    /// Long-term identity key, base64 of its protobuf encoding.
    pub private_key: String,
    /// Last known mesh membership as `<multiaddr>/p2p/<peer-id>` strings.
    /// Rewritten at runtime as membership changes.
    pub bootstrap: Vec<String>,
    /// Overlay listen multiaddr.
    pub listen_addr: String,
    /// Seconds between presence announcements.
    pub announce_interval_secs: u64,
}

/// Tunnel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    /// Wireguard interface name.
    pub interface: String,
    /// Wireguard private key, base64 of 32 bytes.
    pub private_key: String,
    /// Wireguard listen port.
    pub listen_port: u16,
    /// IPv6 prefix shared by every node in the mesh.
    pub network_range: String,
    /// Name hashed into the node's overlay address; hostname when empty.
    pub node_name: String,
    /// Persistent keepalive, seconds; 0 disables it.
    pub persistent_keepalive_secs: Option<u64>,
}

impl Config {
    /// Load the file at `path`, fill in anything missing, validate, and
    /// rewrite the file when something was generated. A missing file is
    /// treated as empty.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg: Config = match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => return Err(err.into()),
        };

        let changed = cfg.ensure_complete()?;
        cfg.validate()?;

        if changed {
            cfg.write_to(path)?;
            info!("wrote completed config to {}", path.display());
        }

        Ok(cfg)
    }

    /// Fill defaults and generate missing key material. Returns whether
    /// anything changed.
    fn ensure_complete(&mut self) -> Result<bool, ConfigError> {
        let mut changed = false;

        if self.p2p.psk.is_empty() {
            let mut raw = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut raw);
            self.p2p.psk = BASE64.encode(raw);
            changed = true;
        }
        if self.p2p.private_key.is_empty() {
            let encoded = Keypair::generate_ed25519()
                .to_protobuf_encoding()
                .map_err(|e| invalid("p2p.private_key", e))?;
            self.p2p.private_key = BASE64.encode(encoded);
            changed = true;
        }
        if self.p2p.listen_addr.is_empty() {
            self.p2p.listen_addr = DEFAULT_LISTEN_ADDR.to_string();
            changed = true;
        }
        if self.p2p.announce_interval_secs == 0 {
            self.p2p.announce_interval_secs = DEFAULT_ANNOUNCE_INTERVAL_SECS;
            changed = true;
        }

        if self.wireguard.interface.is_empty() {
            self.wireguard.interface = DEFAULT_WG_INTERFACE.to_string();
            changed = true;
        }
        if self.wireguard.private_key.is_empty() {
            let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
            self.wireguard.private_key = BASE64.encode(secret.to_bytes());
            changed = true;
        }
        if self.wireguard.listen_port == 0 {
            self.wireguard.listen_port = DEFAULT_WG_LISTEN_PORT;
            changed = true;
        }
        if self.wireguard.network_range.is_empty() {
            self.wireguard.network_range = DEFAULT_WG_NETWORK_RANGE.to_string();
            changed = true;
        }
        if self.wireguard.node_name.is_empty() {
            self.wireguard.node_name = hostname::get()?.to_string_lossy().into_owned();
            changed = true;
        }
        if self.wireguard.persistent_keepalive_secs.is_none() {
            self.wireguard.persistent_keepalive_secs = Some(DEFAULT_WG_KEEPALIVE_SECS);
            changed = true;
        }

        Ok(changed)
    }

    /// Check every field parses into its runtime form.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.p2p.load_psk()?;
        self.p2p.load_identity()?;
        self.p2p.bootstrap_peers()?;
        self.p2p
            .listen_addr
            .parse::<Multiaddr>()
            .map_err(|e| invalid("p2p.listen_addr", e))?;

        self.wireguard.load_private_key()?;
        self.wireguard.overlay_prefix()?;
        if self.wireguard.node_name.is_empty() {
            return Err(invalid("wireguard.node_name", "must not be empty"));
        }

        Ok(())
    }

    /// Whole-file write with owner-only permissions.
    fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let text = toml::to_string_pretty(self)?;
        fs::write(path, text)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

impl P2pConfig {
    pub fn load_psk(&self) -> Result<[u8; 32], ConfigError> {
        let raw = BASE64
            .decode(&self.psk)
            .map_err(|e| invalid("p2p.psk", e))?;
        <[u8; 32]>::try_from(raw.as_slice())
            .map_err(|_| invalid("p2p.psk", format!("expected 32 bytes, got {}", raw.len())))
    }

    pub fn load_identity(&self) -> Result<Keypair, ConfigError> {
        let raw = BASE64
            .decode(&self.private_key)
            .map_err(|e| invalid("p2p.private_key", e))?;
        Keypair::from_protobuf_encoding(&raw).map_err(|e| invalid("p2p.private_key", e))
    }

    /// Parse the bootstrap list into dialable `(peer, address)` pairs.
    pub fn bootstrap_peers(&self) -> Result<Vec<(PeerId, Multiaddr)>, ConfigError> {
        let mut peers = Vec::with_capacity(self.bootstrap.len());
        for raw in &self.bootstrap {
            let mut addr: Multiaddr = raw.parse().map_err(|e| invalid("p2p.bootstrap", e))?;
            match addr.pop() {
                Some(Protocol::P2p(peer)) => peers.push((peer, addr)),
                _ => {
                    return Err(invalid(
                        "p2p.bootstrap",
                        format!("{raw}: missing /p2p/<peer-id> suffix"),
                    ))
                }
            }
        }
        debug!("loaded {} bootstrap peers", peers.len());
        Ok(peers)
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_secs(self.announce_interval_secs)
    }
}

impl WireguardConfig {
    pub fn load_private_key(&self) -> Result<x25519_dalek::StaticSecret, ConfigError> {
        let raw = BASE64
            .decode(&self.private_key)
            .map_err(|e| invalid("wireguard.private_key", e))?;
        let bytes = <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| {
            invalid(
                "wireguard.private_key",
                format!("expected 32 bytes, got {}", raw.len()),
            )
        })?;
        Ok(x25519_dalek::StaticSecret::from(bytes))
    }

    /// The shared overlay prefix. Only byte-aligned prefixes shorter than
    /// /128 leave host bits for the address hash.
    pub fn overlay_prefix(&self) -> Result<Ipv6Net, ConfigError> {
        let net: Ipv6Net = self
            .network_range
            .parse()
            .map_err(|e| invalid("wireguard.network_range", e))?;
        if net.prefix_len() % 8 != 0 || net.prefix_len() == 128 {
            return Err(invalid(
                "wireguard.network_range",
                "prefix length must be byte-aligned and shorter than /128",
            ));
        }
        Ok(net)
    }

    pub fn persistent_keepalive(&self) -> Option<Duration> {
        self.persistent_keepalive_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Shared handle to the on-disk configuration.
///
/// The loaded `Config` is treated as immutable for the lifetime of the
/// process, except for the bootstrap list which the re-bootstrap path
/// rewrites as mesh membership changes. Single writer; see DESIGN.md.
pub struct ConfigFile {
    path: PathBuf,
    config: Mutex<Config>,
}

impl ConfigFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load(&path)?;
        Ok(Self {
            path,
            config: Mutex::new(config),
        })
    }

    /// Copy of the loaded configuration.
    pub fn config(&self) -> Config {
        self.config.lock().clone()
    }
}

impl BootstrapStore for ConfigFile {
    fn save_bootstrap(&self, peers: Vec<String>) -> Result<(), ConfigError> {
        let mut config = self.config.lock();
        config.p2p.bootstrap = peers;
        config.write_to(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file_generates_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wgmesh.toml");

        let cfg = Config::load(&path).unwrap();

        assert!(path.exists());
        assert_eq!(cfg.p2p.load_psk().unwrap().len(), 32);
        cfg.p2p.load_identity().unwrap();
        cfg.wireguard.load_private_key().unwrap();
        assert_eq!(cfg.p2p.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.wireguard.interface, DEFAULT_WG_INTERFACE);
        assert_eq!(cfg.wireguard.listen_port, DEFAULT_WG_LISTEN_PORT);
        assert!(!cfg.wireguard.node_name.is_empty());
    }

    #[test]
    fn test_generated_config_is_stable_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wgmesh.toml");

        let first = Config::load(&path).unwrap();
        let second = Config::load(&path).unwrap();

        assert_eq!(first.p2p.psk, second.p2p.psk);
        assert_eq!(first.p2p.private_key, second.p2p.private_key);
        assert_eq!(first.wireguard.private_key, second.wireguard.private_key);
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("wgmesh.toml");
        Config::load(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_invalid_psk_is_rejected() {
        let mut cfg = Config::default();
        cfg.ensure_complete().unwrap();
        cfg.p2p.psk = "not base64!".to_string();
        assert!(cfg.validate().is_err());

        cfg.p2p.psk = BASE64.encode([0u8; 16]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_network_range_must_be_byte_aligned() {
        let mut cfg = Config::default();
        cfg.ensure_complete().unwrap();

        cfg.wireguard.network_range = "fd00::/63".to_string();
        assert!(cfg.validate().is_err());

        cfg.wireguard.network_range = "fd00::1/128".to_string();
        assert!(cfg.validate().is_err());

        cfg.wireguard.network_range = "fd00::/64".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_bootstrap_entries_need_peer_id() {
        let mut cfg = Config::default();
        cfg.ensure_complete().unwrap();

        cfg.p2p.bootstrap = vec!["/ip4/192.0.2.1/tcp/10042".to_string()];
        assert!(cfg.validate().is_err());

        let peer = Keypair::generate_ed25519().public().to_peer_id();
        cfg.p2p.bootstrap = vec![format!("/ip4/192.0.2.1/tcp/10042/p2p/{peer}")];
        let parsed = cfg.p2p.bootstrap_peers().unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, peer);
        assert_eq!(parsed[0].1, "/ip4/192.0.2.1/tcp/10042".parse().unwrap());
    }

    #[test]
    fn test_save_bootstrap_rewrites_only_bootstrap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wgmesh.toml");
        let file = ConfigFile::open(&path).unwrap();
        let before = file.config();

        let peer = Keypair::generate_ed25519().public().to_peer_id();
        let entry = format!("/ip4/192.0.2.1/tcp/10042/p2p/{peer}");
        file.save_bootstrap(vec![entry.clone()]).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.p2p.bootstrap, vec![entry]);
        assert_eq!(reloaded.p2p.psk, before.p2p.psk);
        assert_eq!(reloaded.wireguard.private_key, before.wireguard.private_key);
    }

    #[test]
    fn test_keepalive_zero_disables() {
        let mut cfg = Config::default();
        cfg.ensure_complete().unwrap();
        assert_eq!(
            cfg.wireguard.persistent_keepalive(),
            Some(Duration::from_secs(DEFAULT_WG_KEEPALIVE_SECS))
        );

        cfg.wireguard.persistent_keepalive_secs = Some(0);
        assert_eq!(cfg.wireguard.persistent_keepalive(), None);
    }
}
