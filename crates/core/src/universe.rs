//! Peer registry and connection lifecycle.
//!
//! Grounded in `original_source/src/universe.cpp`: a `Universe` owns every
//! `Peer` this node has dialed or accepted, the set of addresses it listens
//! on, and a periodic tick that reconnects stale peers and garbage-collects
//! dead ones. It does not know about streams - that's `NetStream`/`Self`.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use ftl_protocol::config::NetConfig;

use crate::handle::{Handle, Handler};
use crate::rpc::{Connection, Dispatcher, Listener, Peer, PeerStatus};

/// Timeout for `find_one`/`find_all`.
const FIND_TIMEOUT: Duration = Duration::from_secs(1);

/// An established (or establishing) peer connection, as handed back by
/// `Universe::connect`/`listen`.
pub type PeerHandle = Arc<Peer>;

/// Registry of peers and listeners for one local node.
///
/// `self_uuid` is this node's own identity, sent in every handshake; a peer
/// whose handshake reports that same uuid back is connecting to ourselves
/// (a loopback dial, or a listener bound on an address we also dial out to)
/// and is dropped rather than kept (`ErrorKind::SelfConnect`).
pub struct Universe {
    self_uuid: Uuid,
    dispatcher: Arc<Dispatcher>,
    peers: Mutex<Vec<Arc<Peer>>>,
    listening_uris: Mutex<Vec<String>>,
    config: NetConfig,
    // Keeps `Handle`s returned by `Peer::on_connect` alive for the peer's
    // lifetime - a `Handle` cancels its registration when dropped.
    callback_handles: Mutex<Vec<Handle>>,
    /// Fired for every peer the moment it's registered, inbound or
    /// outbound, before its handshake completes. `SelfNode` subscribes to
    /// wrap each one in a `Node` without needing its own accept loop.
    on_new_peer: Arc<Handler<Arc<Peer>>>,
    /// Mirrors the original's fixed-size peer array (default 10): `peers`
    /// here is a growable `Vec`, but `connect` still
    /// rejects new connections once this capacity is reached.
    max_peers: AtomicUsize,
}

impl Universe {
    pub fn new(self_uuid: Uuid, config: NetConfig) -> Arc<Self> {
        Arc::new(Self {
            self_uuid,
            dispatcher: Dispatcher::new(),
            peers: Mutex::new(Vec::new()),
            listening_uris: Mutex::new(Vec::new()),
            config,
            callback_handles: Mutex::new(Vec::new()),
            on_new_peer: Handler::new(),
            max_peers: AtomicUsize::new(crate::DEFAULT_MAX_PEERS),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.max_peers.load(Ordering::SeqCst)
    }

    /// Should only be changed before any connections are active - resizing
    /// with active connections could behave oddly (matches the original's
    /// documented caveat on `setMaxConnections`).
    pub fn set_max_connections(&self, max: usize) {
        self.max_peers.store(max, Ordering::SeqCst);
    }

    /// Number of currently available peers, connected or not - they may be
    /// disconnected/errored until the next garbage-collection tick.
    pub fn number_of_nodes(&self) -> usize {
        self.peers.lock().len()
    }

    /// Subscribe to every peer registered from now on (universe-owns-peers
    /// model; used by `SelfNode` to maintain its own `Node` wrappers
    /// without duplicating accept/connect logic).
    pub fn on_new_peer<F>(&self, f: F) -> Handle
    where
        F: Fn(&Arc<Peer>) -> bool + Send + Sync + 'static,
    {
        self.on_new_peer.on(f)
    }

    pub fn self_uuid(&self) -> Uuid {
        self.self_uuid
    }

    /// The universe-wide dispatcher consulted by every peer's local
    /// dispatcher when a method isn't bound per-connection.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Accept inbound connections on `listener` until it errors. Spawns its
    /// own background task; call once per bound address.
    pub fn listen(self: &Arc<Self>, listener: Box<dyn Listener>) {
        let local_addr = listener.local_addr();
        self.listening_uris.lock().push(local_addr.clone());
        let universe = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(conn) => {
                        tracing::debug!(peer = %conn.peer_addr(), local = %local_addr, "accepted inbound connection");
                        universe.connect(conn).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, local = %local_addr, "listener accept failed, stopping accept loop");
                        break;
                    }
                }
            }
        });
    }

    pub fn get_listening_uris(&self) -> Vec<String> {
        self.listening_uris.lock().clone()
    }

    /// Register and start a peer over an already-established connection,
    /// dialed out or accepted.
    pub async fn connect(self: &Arc<Self>, conn: Box<dyn Connection>) -> PeerHandle {
        let peer = Peer::new(conn, self.dispatcher.clone(), self.self_uuid);
        self.wire_self_connect_guard(&peer);

        if self.peers.lock().len() >= self.max_connections() {
            tracing::warn!(
                peer = %peer.peer_addr(),
                max = self.max_connections(),
                "peer array at capacity, rejecting connection"
            );
            peer.close(false).await;
            return peer;
        }

        self.peers.lock().push(peer.clone());
        self.on_new_peer.trigger(&peer);
        peer.start();
        peer
    }

    fn wire_self_connect_guard(self: &Arc<Self>, peer: &Arc<Peer>) {
        let self_uuid = self.self_uuid;
        let universe = Arc::downgrade(self);
        let weak_peer = Arc::downgrade(peer);
        let handle = peer.on_connect(move |_| {
            if let Some(p) = weak_peer.upgrade() {
                if p.remote_uuid() == Some(self_uuid) {
                    let universe = universe.clone();
                    tokio::spawn(async move {
                        tracing::warn!("detected self-connect, closing");
                        p.close(false).await;
                        if let Some(u) = universe.upgrade() {
                            u.remove_peer(&p);
                        }
                    });
                }
            }
            true
        });
        self.callback_handles.lock().push(handle);
    }

    fn remove_peer(&self, peer: &Arc<Peer>) {
        self.peers.lock().retain(|p| !Arc::ptr_eq(p, peer));
    }

    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().clone()
    }

    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().iter().filter(|p| p.is_connected()).cloned().collect()
    }

    pub fn find_peer_by_uuid(&self, uuid: Uuid) -> Option<Arc<Peer>> {
        self.peers.lock().iter().find(|p| p.remote_uuid() == Some(uuid)).cloned()
    }

    /// Fire a notification at every connected peer. Failures are logged,
    /// not propagated - a broadcast has no single caller waiting on a
    /// result.
    pub async fn broadcast(&self, name: impl Into<String>, args: Vec<Value>) {
        let name = name.into();
        for peer in self.connected_peers() {
            let name = name.clone();
            let args = args.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.notify(name, args).await {
                    tracing::warn!(error = %e, "broadcast notify failed");
                }
            });
        }
    }

    /// Call `name` on every connected peer and return the first success
    /// within one second (mirrors the original's `findOne`).
    pub async fn find_one<R>(&self, name: &str, args: Vec<Value>) -> Option<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let peers = self.connected_peers();
        if peers.is_empty() {
            return None;
        }
        let mut set = JoinSet::new();
        for peer in peers {
            let name = name.to_string();
            let args = args.clone();
            set.spawn(async move { peer.call::<R>(&name, args).await.ok() });
        }
        let gather = async {
            while let Some(res) = set.join_next().await {
                if let Ok(Some(value)) = res {
                    return Some(value);
                }
            }
            None
        };
        tokio::time::timeout(FIND_TIMEOUT, gather).await.unwrap_or(None)
    }

    /// Call `name` on every connected peer and collect every success within
    /// one second (mirrors the original's `findAll`).
    pub async fn find_all<R>(&self, name: &str, args: Vec<Value>) -> Vec<R>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let peers = self.connected_peers();
        let mut set = JoinSet::new();
        for peer in peers {
            let name = name.to_string();
            let args = args.clone();
            set.spawn(async move { peer.call::<R>(&name, args).await.ok() });
        }
        let mut out = Vec::new();
        let gather = async {
            while let Some(res) = set.join_next().await {
                if let Ok(Some(value)) = res {
                    out.push(value);
                }
            }
        };
        let _ = tokio::time::timeout(FIND_TIMEOUT, gather).await;
        out
    }

    /// Peers currently in `Reconnecting` state. Redialing them is the
    /// caller's responsibility: this layer is transport-agnostic and keeps
    /// no stored dial target to redial with on its own (see DESIGN.md).
    pub fn peers_needing_reconnect(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().iter().filter(|p| p.status() == PeerStatus::Reconnecting).cloned().collect()
    }

    /// Start the periodic GC tick. Runs forever in its own task at
    /// `config.poll_interval_ms`.
    pub fn start_periodic(self: &Arc<Self>) {
        let universe = self.clone();
        let interval_ms = self.config.poll_interval_ms.max(1);
        tokio::spawn(async move {
            let mut marked: Vec<usize> = Vec::new();
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                marked = universe.collect_garbage(marked);
            }
        });
    }

    /// Two-phase GC: a peer only drops once it has been observed
    /// `Disconnected` and idle on two consecutive ticks, so a peer that is
    /// mid-teardown on one tick isn't yanked out from under in-flight work.
    fn collect_garbage(&self, previously_marked: Vec<usize>) -> Vec<usize> {
        let mut peers = self.peers.lock();
        let candidates: Vec<usize> = peers
            .iter()
            .filter(|p| p.status() == PeerStatus::Disconnected && p.is_idle())
            .map(|p| Arc::as_ptr(p) as usize)
            .collect();

        let previously: HashSet<usize> = previously_marked.into_iter().collect();
        let to_drop: HashSet<usize> = candidates.iter().copied().filter(|addr| previously.contains(addr)).collect();

        if !to_drop.is_empty() {
            let before = peers.len();
            peers.retain(|p| !to_drop.contains(&(Arc::as_ptr(p) as usize)));
            tracing::debug!(dropped = before - peers.len(), "garbage collected disconnected peers");
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct LoopbackConnection {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    #[async_trait]
    impl Connection for LoopbackConnection {
        async fn send(&self, data: &[u8]) -> std::io::Result<()> {
            self.tx.send(data.to_vec()).map_err(|_| std::io::Error::other("closed"))
        }
        async fn recv(&self) -> std::io::Result<Option<Vec<u8>>> {
            Ok(self.rx.lock().await.recv().await)
        }
        async fn close(&self) -> std::io::Result<()> {
            Ok(())
        }
        fn peer_addr(&self) -> String {
            "loopback".to_string()
        }
    }

    fn loopback_pair() -> (Box<dyn Connection>, Box<dyn Connection>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Box::new(LoopbackConnection { tx: a_tx, rx: tokio::sync::Mutex::new(a_rx) }),
            Box::new(LoopbackConnection { tx: b_tx, rx: tokio::sync::Mutex::new(b_rx) }),
        )
    }

    #[tokio::test]
    async fn connect_reaches_connected_state() {
        let universe_a = Universe::new(Uuid::new_v4(), NetConfig::default());
        let universe_b = Universe::new(Uuid::new_v4(), NetConfig::default());
        let (conn_a, conn_b) = loopback_pair();

        let peer_a = universe_a.connect(conn_a).await;
        let _peer_b = universe_b.connect(conn_b).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(peer_a.is_connected());
        assert_eq!(universe_a.connected_peers().len(), 1);
    }

    #[tokio::test]
    async fn self_connect_is_dropped() {
        let shared_uuid = Uuid::new_v4();
        let universe = Universe::new(shared_uuid, NetConfig::default());
        let (conn_a, conn_b) = loopback_pair();

        universe.connect(conn_a).await;
        universe.connect(conn_b).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(universe.connected_peers().len(), 0);
        assert_eq!(universe.all_peers().len(), 0);
    }

    #[tokio::test]
    async fn find_one_calls_bound_method() {
        let universe_a = Universe::new(Uuid::new_v4(), NetConfig::default());
        let universe_b = Universe::new(Uuid::new_v4(), NetConfig::default());
        universe_b.dispatcher().bind("echo", |args| Ok(args.first().cloned().unwrap_or(Value::Null)));

        let (conn_a, conn_b) = loopback_pair();
        universe_a.connect(conn_a).await;
        universe_b.connect(conn_b).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result: Option<i64> = universe_a.find_one("echo", vec![Value::from(42)]).await;
        assert_eq!(result, Some(42));
    }

    #[test]
    fn garbage_collection_requires_two_consecutive_ticks() {
        let universe = Universe::new(Uuid::new_v4(), NetConfig::default());
        // No peers registered: both ticks should be no-ops and return empty.
        let marked = universe.collect_garbage(Vec::new());
        assert!(marked.is_empty());
        let marked = universe.collect_garbage(marked);
        assert!(marked.is_empty());
    }
}
