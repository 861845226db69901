//! Overlay transport worker
//!
//! Owns the swarm for the lifetime of the process and runs the whole
//! announcement plane from one select loop: the periodic announce, the
//! consume path, address observation, dial management, and the periodic
//! re-bootstrap with its self-healing bootstrap-list persistence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic},
    identify,
    identity::Keypair,
    pnet::PreSharedKey,
    swarm::{dial_opts::DialOpts, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmesh_core::{AddrInfo, Announce, BootstrapStore, Config, NetworkState, TunnelControl};

use crate::behaviour::{build_swarm, MeshBehaviour, MeshBehaviourEvent, ANNOUNCE_TOPIC};
use crate::bootstrap::AddrBook;
use crate::error::P2pError;

/// Upper bound on concurrently in-flight connect attempts.
const MAX_PARALLEL_CONNECTS: usize = 8;
/// Per-attempt connect deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(16);
/// How often the re-bootstrap pass runs.
const REBOOTSTRAP_INTERVAL: Duration = Duration::from_secs(10);

/// A connect attempt handed to the swarm loop.
struct DialRequest {
    peer: PeerId,
    addrs: Vec<Multiaddr>,
    done: oneshot::Sender<Result<(), String>>,
}

/// Schedules bounded, cancellable connect attempts onto the swarm loop.
#[derive(Clone)]
struct Connector {
    limit: Arc<Semaphore>,
    dial_tx: mpsc::Sender<DialRequest>,
    cancel: CancellationToken,
}

impl Connector {
    fn new(dial_tx: mpsc::Sender<DialRequest>, cancel: CancellationToken) -> Self {
        Self {
            limit: Arc::new(Semaphore::new(MAX_PARALLEL_CONNECTS)),
            dial_tx,
            cancel,
        }
    }

    /// Fire-and-forget connect attempt. Holds one semaphore permit for
    /// the duration of the attempt; cancellation while waiting for a
    /// permit returns without dialing.
    fn spawn_connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        let this = self.clone();
        tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = this.cancel.cancelled() => return,
                permit = this.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let (done_tx, done_rx) = oneshot::channel();
            let request = DialRequest {
                peer,
                addrs,
                done: done_tx,
            };
            if this.dial_tx.send(request).await.is_err() {
                return;
            }

            match tokio::time::timeout(CONNECT_TIMEOUT, done_rx).await {
                Ok(Ok(Ok(()))) => debug!("connected to {peer}"),
                Ok(Ok(Err(err))) => debug!("failed to connect to {peer}: {err}"),
                Ok(Err(_)) => debug!("connect attempt to {peer} abandoned"),
                Err(_) => debug!("connect attempt to {peer} timed out"),
            }
        });
    }
}

/// The overlay transport component.
pub struct P2pWorker {
    keypair: Keypair,
    psk: PreSharedKey,
    listen_addr: Multiaddr,
    announce_interval: Duration,
    bootstrap: Vec<(PeerId, Multiaddr)>,
    bootstrap_raw: Vec<String>,
    state: Arc<NetworkState>,
    tunnel: Arc<dyn TunnelControl>,
    store: Arc<dyn BootstrapStore>,
}

impl P2pWorker {
    pub fn new(
        cfg: &Config,
        state: Arc<NetworkState>,
        tunnel: Arc<dyn TunnelControl>,
        store: Arc<dyn BootstrapStore>,
    ) -> Result<Self, P2pError> {
        let keypair = cfg.p2p.load_identity()?;
        let psk = PreSharedKey::new(cfg.p2p.load_psk()?);
        let listen_addr = cfg
            .p2p
            .listen_addr
            .parse()
            .map_err(|e| P2pError::Listen(format!("{}: {e}", cfg.p2p.listen_addr)))?;
        let bootstrap = cfg.p2p.bootstrap_peers()?;

        Ok(Self {
            keypair,
            psk,
            listen_addr,
            announce_interval: cfg.p2p.announce_interval(),
            bootstrap,
            bootstrap_raw: cfg.p2p.bootstrap.clone(),
            state,
            tunnel,
            store,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    /// Run until cancelled or the first fatal error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), P2pError> {
        let local = self.local_peer_id();

        let mut swarm = build_swarm(self.keypair.clone(), self.psk)?;
        swarm
            .listen_on(self.listen_addr.clone())
            .map_err(|e| P2pError::Listen(e.to_string()))?;

        let topic = IdentTopic::new(ANNOUNCE_TOPIC);
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| P2pError::Subscribe(e.to_string()))?;

        let (dial_tx, mut dial_rx) = mpsc::channel(64);
        let connector = Connector::new(dial_tx, cancel.clone());

        let mut book = AddrBook::new(local);
        for (peer, addr) in &self.bootstrap {
            book.add(*peer, addr.clone());
        }

        // initial bootstrap: one attempt per configured peer
        for (peer, addr) in &self.bootstrap {
            connector.spawn_connect(*peer, vec![addr.clone()]);
        }

        info!("overlay transport starting as {local}");

        let mut ctx = EventLoop {
            swarm,
            topic,
            local,
            state: self.state,
            tunnel: self.tunnel,
            store: self.store,
            connector,
            book,
            connected: HashMap::new(),
            greeted: HashSet::new(),
            pending_dials: HashMap::new(),
            last_saved: self.bootstrap_raw,
        };

        // first tick fires immediately: announce right at startup
        let mut announce_ticker = tokio::time::interval(self.announce_interval);
        let mut bootstrap_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + REBOOTSTRAP_INTERVAL,
            REBOOTSTRAP_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("overlay transport stopping");
                    return Ok(());
                }
                event = ctx.swarm.select_next_some() => {
                    ctx.handle_swarm_event(event)?;
                }
                Some(request) = dial_rx.recv() => {
                    ctx.handle_dial_request(request);
                }
                _ = announce_ticker.tick() => {
                    ctx.announce_local();
                    ctx.update_addrs();
                }
                _ = bootstrap_ticker.tick() => {
                    ctx.bootstrap_once();
                }
            }
        }
    }
}

/// Everything the select loop mutates.
struct EventLoop {
    swarm: Swarm<MeshBehaviour>,
    topic: IdentTopic,
    local: PeerId,
    state: Arc<NetworkState>,
    tunnel: Arc<dyn TunnelControl>,
    store: Arc<dyn BootstrapStore>,
    connector: Connector,
    book: AddrBook,
    /// One live remote address per connected peer.
    connected: HashMap<PeerId, Multiaddr>,
    /// Peers that already received a welcome announce.
    greeted: HashSet<PeerId>,
    /// Dial completions waiting on swarm events.
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<(), String>>>>,
    /// Bootstrap list as last persisted.
    last_saved: Vec<String>,
}

impl EventLoop {
    fn handle_swarm_event(&mut self, event: SwarmEvent<MeshBehaviourEvent>) -> Result<(), P2pError> {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {address}");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let remote = endpoint.get_remote_address().clone();
                debug!("connected to {peer_id} at {remote}");
                self.book.add(peer_id, remote.clone());
                self.connected.insert(peer_id, remote);
                self.resolve_dials(&peer_id, Ok(()));

                // a fresh peer gets one extra announce so it does not have
                // to wait out the announce interval
                if self.greeted.insert(peer_id) {
                    self.announce_local();
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    self.connected.remove(&peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    self.resolve_dials(&peer, Err(error.to_string()));
                }
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                self.handle_announce(propagation_source, &message.data)?;
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.book.add(peer_id, addr);
                }
            }
            SwarmEvent::Behaviour(MeshBehaviourEvent::Upnp(event)) => {
                debug!("upnp: {event:?}");
            }
            _ => {}
        }
        Ok(())
    }

    /// Consume one gossip message. An undecodable payload is fatal: it
    /// means the mesh speaks a different protocol version.
    fn handle_announce(&mut self, sender: PeerId, data: &[u8]) -> Result<(), P2pError> {
        if sender == self.local {
            return Ok(());
        }

        let announce = Announce::decode(data).map_err(|e| {
            warn!("undecodable announce from {sender}");
            P2pError::Protocol(e.to_string())
        })?;

        debug!("announce from {sender}");
        self.state.on_announce(sender, announce.clone());

        // remember the advertised addresses and try to reach the peer
        if let Ok(peer) = announce.addr_info.peer_id() {
            if peer != self.local {
                let addrs = announce.addr_info.addrs();
                for addr in &addrs {
                    self.book.add(peer, addr.clone());
                }
                if !addrs.is_empty() {
                    self.connector.spawn_connect(peer, addrs);
                }
            }
        }

        Ok(())
    }

    /// Publish our presence: listen plus confirmed external addresses,
    /// and the current tunnel state. Publish failures are transient and
    /// only logged.
    fn announce_local(&mut self) {
        let mut addrs: Vec<Multiaddr> = self.swarm.listeners().cloned().collect();
        for addr in self.swarm.external_addresses() {
            if !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }

        let announce = Announce {
            addr_info: AddrInfo::new(&self.local, &addrs),
            wireguard: self.tunnel.announce_info(),
        };

        let data = match announce.encode() {
            Ok(data) => data,
            Err(err) => {
                warn!("could not encode announce: {err}");
                return;
            }
        };

        if let Err(err) = self
            .swarm
            .behaviour_mut()
            .gossipsub
            .publish(self.topic.clone(), data)
        {
            debug!("could not publish announce: {err}");
        }
    }

    /// Record one live transport address per connected peer, hand the
    /// map to the state store, then poke the tunnel loop.
    fn update_addrs(&mut self) {
        self.state.update_addrs(self.connected.clone());
        self.tunnel.force_update();
    }

    /// Re-dial every known peer and persist the mesh membership when it
    /// changed since the last save.
    fn bootstrap_once(&mut self) {
        for (peer, addrs) in self.book.peers() {
            self.connector.spawn_connect(peer, addrs);
        }

        let known = self.book.bootstrap_list();
        if known != self.last_saved {
            match self.store.save_bootstrap(known.clone()) {
                Ok(()) => {
                    info!("persisted {} bootstrap peers", known.len());
                    self.last_saved = known;
                }
                Err(err) => warn!("failed to persist bootstrap peers: {err}"),
            }
        }

        info!(
            "connected to {}/{} known peers",
            self.connected.len(),
            self.book.len()
        );
    }

    fn handle_dial_request(&mut self, request: DialRequest) {
        if request.peer == self.local || self.swarm.is_connected(&request.peer) {
            let _ = request.done.send(Ok(()));
            return;
        }

        let opts = DialOpts::peer_id(request.peer)
            .addresses(request.addrs)
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials
                    .entry(request.peer)
                    .or_default()
                    .push(request.done);
            }
            Err(err) => {
                let _ = request.done.send(Err(err.to_string()));
            }
        }
    }

    fn resolve_dials(&mut self, peer: &PeerId, result: Result<(), String>) {
        if let Some(waiters) = self.pending_dials.remove(peer) {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use wgmesh_core::{ConfigError, WireguardState};

    #[derive(Default)]
    struct RecordingTunnel {
        announces: AtomicUsize,
        updates: AtomicUsize,
    }

    impl TunnelControl for RecordingTunnel {
        fn announce_info(&self) -> WireguardState {
            self.announces.fetch_add(1, Ordering::SeqCst);
            WireguardState {
                public_key: "pk".to_string(),
                selected_addr: "fd00::1".to_string(),
                port: 10043,
            }
        }

        fn force_update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        saves: Mutex<Vec<Vec<String>>>,
    }

    impl RecordingStore {
        fn saves(&self) -> Vec<Vec<String>> {
            self.saves.lock().unwrap().clone()
        }
    }

    impl BootstrapStore for RecordingStore {
        fn save_bootstrap(&self, peers: Vec<String>) -> Result<(), ConfigError> {
            self.saves.lock().unwrap().push(peers);
            Ok(())
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        let identity = Keypair::generate_ed25519();
        cfg.p2p.psk = BASE64.encode([7u8; 32]);
        cfg.p2p.private_key = BASE64.encode(identity.to_protobuf_encoding().unwrap());
        cfg.p2p.listen_addr = "/ip4/127.0.0.1/tcp/0".to_string();
        cfg.p2p.announce_interval_secs = 300;
        cfg
    }

    fn worker_for(cfg: &Config) -> Result<P2pWorker, P2pError> {
        let local = cfg.p2p.load_identity().unwrap().public().to_peer_id();
        P2pWorker::new(
            cfg,
            Arc::new(NetworkState::new(local)),
            Arc::new(RecordingTunnel::default()),
            Arc::new(RecordingStore::default()),
        )
    }

    fn peer() -> PeerId {
        Keypair::generate_ed25519().public().to_peer_id()
    }

    fn valid_announce(peer: &PeerId, addr: &str) -> Announce {
        Announce {
            addr_info: AddrInfo::new(peer, &[addr.parse().unwrap()]),
            wireguard: WireguardState {
                public_key: "pk".to_string(),
                selected_addr: "fd00::7".to_string(),
                port: 10043,
            },
        }
    }

    /// An event loop wired to recording fakes, plus the receiving end of
    /// the dial channel so tests can observe scheduled connect attempts.
    struct Fixture {
        ctx: EventLoop,
        dial_rx: mpsc::Receiver<DialRequest>,
        tunnel: Arc<RecordingTunnel>,
        store: Arc<RecordingStore>,
        local: PeerId,
    }

    fn event_loop() -> Fixture {
        let keypair = Keypair::generate_ed25519();
        let local = keypair.public().to_peer_id();
        let swarm = build_swarm(keypair, PreSharedKey::new([7u8; 32])).unwrap();

        let (dial_tx, dial_rx) = mpsc::channel(16);
        let tunnel = Arc::new(RecordingTunnel::default());
        let store = Arc::new(RecordingStore::default());

        let ctx = EventLoop {
            swarm,
            topic: IdentTopic::new(ANNOUNCE_TOPIC),
            local,
            state: Arc::new(NetworkState::new(local)),
            tunnel: tunnel.clone(),
            store: store.clone(),
            connector: Connector::new(dial_tx, CancellationToken::new()),
            book: AddrBook::new(local),
            connected: HashMap::new(),
            greeted: HashSet::new(),
            pending_dials: HashMap::new(),
            last_saved: Vec::new(),
        };

        Fixture {
            ctx,
            dial_rx,
            tunnel,
            store,
            local,
        }
    }

    #[test]
    fn test_worker_construction() {
        let cfg = test_config();
        let worker = worker_for(&cfg).unwrap();

        let expected = cfg.p2p.load_identity().unwrap().public().to_peer_id();
        assert_eq!(worker.local_peer_id(), expected);
        assert_eq!(worker.announce_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_worker_rejects_short_psk() {
        let mut cfg = test_config();
        cfg.p2p.psk = BASE64.encode([7u8; 16]);
        assert!(matches!(worker_for(&cfg), Err(P2pError::Config(_))));
    }

    #[test]
    fn test_worker_rejects_bad_listen_addr() {
        let mut cfg = test_config();
        cfg.p2p.listen_addr = "127.0.0.1:10042".to_string();
        assert!(matches!(worker_for(&cfg), Err(P2pError::Listen(_))));
    }

    #[tokio::test]
    async fn test_swarm_builds_with_psk_transport() {
        let cfg = test_config();
        let swarm = build_swarm(
            cfg.p2p.load_identity().unwrap(),
            PreSharedKey::new(cfg.p2p.load_psk().unwrap()),
        )
        .unwrap();

        let expected = cfg.p2p.load_identity().unwrap().public().to_peer_id();
        assert_eq!(*swarm.local_peer_id(), expected);
    }

    #[tokio::test]
    async fn test_bootstrap_once_persists_only_on_change() {
        let mut fx = event_loop();

        // empty book, nothing persisted yet: nothing to save
        fx.ctx.bootstrap_once();
        assert!(fx.store.saves().is_empty());

        let remote = peer();
        fx.ctx
            .book
            .add(remote, "/ip4/192.0.2.1/tcp/10042".parse().unwrap());

        // membership changed: exactly one save, with the rendered list
        fx.ctx.bootstrap_once();
        let saves = fx.store.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0], fx.ctx.book.bootstrap_list());

        // unchanged membership: the second round must not write again
        fx.ctx.bootstrap_once();
        assert_eq!(fx.store.saves().len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_once_redials_known_peers() {
        let mut fx = event_loop();
        let remote = peer();
        fx.ctx
            .book
            .add(remote, "/ip4/192.0.2.1/tcp/10042".parse().unwrap());

        fx.ctx.bootstrap_once();

        let request = tokio::time::timeout(Duration::from_secs(1), fx.dial_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.peer, remote);
        assert_eq!(
            request.addrs,
            vec!["/ip4/192.0.2.1/tcp/10042".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_handle_announce_ignores_self() {
        let mut fx = event_loop();

        // the self check comes before decoding, so even garbage is fine
        fx.ctx.handle_announce(fx.local, &[0xff; 5]).unwrap();
        assert!(fx.ctx.state.is_empty());
    }

    #[tokio::test]
    async fn test_handle_announce_undecodable_is_fatal() {
        let mut fx = event_loop();

        let err = fx.ctx.handle_announce(peer(), &[0xff; 5]).unwrap_err();
        assert!(matches!(err, P2pError::Protocol(_)));
        assert!(fx.ctx.state.is_empty());
    }

    #[tokio::test]
    async fn test_handle_announce_feeds_state_and_schedules_connect() {
        let mut fx = event_loop();
        let remote = peer();
        let data = valid_announce(&remote, "/ip4/198.51.100.7/tcp/10042")
            .encode()
            .unwrap();

        fx.ctx.handle_announce(remote, &data).unwrap();

        assert_eq!(fx.ctx.state.len(), 1);

        // the advertised address lands in the book
        assert_eq!(
            fx.ctx.book.bootstrap_list(),
            vec![format!("/ip4/198.51.100.7/tcp/10042/p2p/{remote}")]
        );

        // and a bounded connect attempt reaches the dial channel
        let request = tokio::time::timeout(Duration::from_secs(1), fx.dial_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.peer, remote);
        assert_eq!(
            request.addrs,
            vec!["/ip4/198.51.100.7/tcp/10042".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn test_update_addrs_snapshots_connections_and_pokes_tunnel() {
        let mut fx = event_loop();
        let remote = peer();

        fx.ctx
            .state
            .on_announce(remote, valid_announce(&remote, "/ip4/198.51.100.7/tcp/10042"));
        fx.ctx
            .connected
            .insert(remote, "/ip4/203.0.113.9/tcp/10042".parse().unwrap());

        fx.ctx.update_addrs();

        assert_eq!(fx.tunnel.updates.load(Ordering::SeqCst), 1);
        let snapshot = fx.ctx.state.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].addr, "203.0.113.9");
    }

    #[tokio::test]
    async fn test_announce_local_reads_tunnel_state() {
        let mut fx = event_loop();

        // with no mesh peers the publish fails, which is tolerated
        fx.ctx.announce_local();
        assert_eq!(fx.tunnel.announces.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dial_request_for_self_resolves_immediately() {
        let mut fx = event_loop();

        let (done_tx, done_rx) = oneshot::channel();
        fx.ctx.handle_dial_request(DialRequest {
            peer: fx.local,
            addrs: Vec::new(),
            done: done_tx,
        });

        assert_eq!(done_rx.await.unwrap(), Ok(()));
        assert!(fx.ctx.pending_dials.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_dials_completes_pending_waiters() {
        let mut fx = event_loop();
        let remote = peer();

        let (done_tx, done_rx) = oneshot::channel();
        fx.ctx.handle_dial_request(DialRequest {
            peer: remote,
            addrs: vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()],
            done: done_tx,
        });
        assert!(fx.ctx.pending_dials.contains_key(&remote));

        fx.ctx.resolve_dials(&remote, Err("refused".to_string()));

        assert_eq!(done_rx.await.unwrap(), Err("refused".to_string()));
        assert!(fx.ctx.pending_dials.is_empty());
    }
}
