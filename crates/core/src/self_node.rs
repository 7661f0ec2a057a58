//! `Self`/`Node` facade: thin public factory calls over a peer registry.
//!
//! Grounded in `original_source/include/ftl/protocol/self.hpp` and
//! `node.hpp`: `Node` is a thin RPC wrapper around one `Peer`, and
//! `SelfNode` is the per-process singleton that owns a `Universe`, wraps
//! every peer it sees in a `Node`, and answers the handful of built-in RPC
//! names (`restart`, `shutdown`, `node_details`, `get_cfg`/`update_cfg`,
//! `list_configurables`, `create_stream`) other nodes call on it. It also
//! owns the advertised-stream registry (`find_stream`/`list_streams`),
//! since that registry is process-wide rather than per-`NetStream`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use ftl_protocol::config::NetConfig;
use ftl_protocol::uri::{Scheme, Uri};
use ftl_protocol::{ErrorKind, FrameID, ProtocolError};

use crate::handle::{Handle, Handler};
use crate::net_stream::NetStream;
use crate::rpc::{Connector, Peer};
use crate::stream::Stream;
use crate::universe::Universe;

/// Node kind, per `original_source/include/ftl/protocol/node.hpp`'s
/// `NodeType`. A web-service node is a peer answering `find_stream` on
/// behalf of nodes that don't host the stream themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Node,
    WebService,
}

/// An API wrapper around one network connection: the RPC calls a node
/// exposes, plus status/control. Releasing the `Arc` does not close the
/// connection - `close()` must be called first.
pub struct Node {
    peer: Arc<Peer>,
    node_type: Mutex<NodeType>,
}

impl Node {
    pub fn new(peer: Arc<Peer>) -> Arc<Self> {
        Arc::new(Self { peer, node_type: Mutex::new(NodeType::Node) })
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// `None` until the handshake has completed.
    pub fn id(&self) -> Option<Uuid> {
        self.peer.remote_uuid()
    }

    pub fn uri(&self) -> String {
        self.peer.peer_addr()
    }

    pub fn status(&self) -> crate::rpc::PeerStatus {
        self.peer.status()
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_connected()
    }

    /// True in every state except a permanently failed/closed connection -
    /// mirrors the original's `isValid()` (valid whenever an OS socket
    /// still exists: `Connecting` or `Connected`).
    pub fn is_valid(&self) -> bool {
        matches!(self.status(), crate::rpc::PeerStatus::Connecting | crate::rpc::PeerStatus::Connected)
    }

    pub fn node_type(&self) -> NodeType {
        *self.node_type.lock()
    }

    pub(crate) fn mark_web_service(&self) {
        *self.node_type.lock() = NodeType::WebService;
    }

    pub fn no_reconnect(&self) {
        self.peer.set_can_reconnect(false);
    }

    pub async fn close(&self, retry: bool) {
        self.peer.close(retry).await;
    }

    /// Block until the connection's handshake completes, or `seconds`
    /// elapses. Intended for tests - production code should use
    /// `SelfNode::on_connect` instead.
    pub async fn wait_connection(&self, seconds: u64) -> bool {
        if self.is_connected() {
            return true;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.is_connected()
    }

    pub async fn ping(&self) -> ftl_protocol::Result<i64> {
        self.peer.call("__ping__", vec![]).await
    }

    pub async fn restart(&self) -> ftl_protocol::Result<()> {
        notify(&self.peer, "restart", vec![]).await
    }

    pub async fn shutdown(&self) -> ftl_protocol::Result<()> {
        notify(&self.peer, "shutdown", vec![]).await
    }

    pub async fn has_stream(&self, uri: &str) -> bool {
        self.peer.call::<Uuid>("find_stream", vec![Value::from(uri)]).await.is_ok()
    }

    /// Ask this node to create/open a stream at `uri`, addressed locally as
    /// `id` - used by a web-service node telling a regular node to start
    /// hosting a stream.
    pub async fn create_stream(&self, uri: &str, id: FrameID) -> ftl_protocol::Result<()> {
        notify(&self.peer, "create_stream", vec![Value::from(uri), serde_json::to_value(id).expect("FrameID always serializes")]).await
    }

    pub async fn details(&self) -> ftl_protocol::Result<Value> {
        self.peer.call("node_details", vec![]).await
    }

    pub async fn get_cfg(&self, path: &str) -> ftl_protocol::Result<Value> {
        self.peer.call("get_cfg", vec![Value::from(path)]).await
    }

    pub async fn set_cfg(&self, path: &str, value: Value) -> ftl_protocol::Result<()> {
        notify(&self.peer, "update_cfg", vec![Value::from(path), value]).await
    }

    pub async fn list_configurables(&self) -> ftl_protocol::Result<Vec<String>> {
        self.peer.call("list_configurables", vec![]).await
    }
}

async fn notify(peer: &Arc<Peer>, name: &str, args: Vec<Value>) -> ftl_protocol::Result<()> {
    peer.notify(name, args).await.map_err(|e| ProtocolError::new(ErrorKind::SocketError, e.to_string()))
}

type ConfigurableHandler = Box<dyn Fn(&str) -> Value + Send + Sync>;
type SetConfigHandler = Box<dyn Fn(&str, &Value) + Send + Sync>;
type ListConfigHandler = Box<dyn Fn() -> Vec<String> + Send + Sync>;
type NodeDetailsHandler = Box<dyn Fn() -> Value + Send + Sync>;
type CreateStreamHandler = Box<dyn Fn(&str, FrameID) + Send + Sync>;

/// Per-process RPC + node-management facade. Owns a `Universe`, wraps every
/// peer it sees in a `Node`, and serves the built-in bindings other nodes
/// call on it (restart/shutdown/node_details/get_cfg/update_cfg/
/// list_configurables/create_stream) plus the stream discovery registry
/// (`find_stream`/`list_streams`) that `NetStream` consumers resolve
/// against.
///
/// Typically a process has exactly one `SelfNode`; more are created in
/// tests to exercise multi-node scenarios in-process.
pub struct SelfNode {
    universe: Arc<Universe>,
    connector: Arc<dyn Connector>,
    nodes: Mutex<Vec<Arc<Node>>>,
    web_service: Mutex<Option<Arc<Node>>>,
    streams: Mutex<HashMap<String, Arc<dyn Stream>>>,
    net_config: NetConfig,

    on_connect: Arc<Handler<Arc<Node>>>,
    on_disconnect: Arc<Handler<Arc<Node>>>,
    on_error: Arc<Handler<(Option<Arc<Node>>, ProtocolError)>>,

    on_restart: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    on_shutdown: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    on_node_details: Mutex<Option<NodeDetailsHandler>>,
    on_get_config: Mutex<Option<ConfigurableHandler>>,
    on_set_config: Mutex<Option<SetConfigHandler>>,
    on_list_config: Mutex<Option<ListConfigHandler>>,
    on_create_stream: Mutex<Option<CreateStreamHandler>>,

    callback_handles: Mutex<Vec<Handle>>,
}

impl SelfNode {
    pub fn new(universe: Arc<Universe>, connector: Arc<dyn Connector>, net_config: NetConfig) -> Arc<Self> {
        let this = Arc::new_cyclic(|weak: &std::sync::Weak<SelfNode>| {
            Self::bind_builtins(&universe, weak.clone());
            Self {
                universe,
                connector,
                nodes: Mutex::new(Vec::new()),
                web_service: Mutex::new(None),
                streams: Mutex::new(HashMap::new()),
                net_config,
                on_connect: Handler::new(),
                on_disconnect: Handler::new(),
                on_error: Handler::new(),
                on_restart: Mutex::new(None),
                on_shutdown: Mutex::new(None),
                on_node_details: Mutex::new(None),
                on_get_config: Mutex::new(None),
                on_set_config: Mutex::new(None),
                on_list_config: Mutex::new(None),
                on_create_stream: Mutex::new(None),
                callback_handles: Mutex::new(Vec::new()),
            }
        });
        this.wire_peer_hooks();
        this
    }

    pub fn universe(&self) -> &Arc<Universe> {
        &self.universe
    }

    /// Bind the handful of RPC names that accept a call before a `SelfNode`
    /// fully exists yet (the universe's shared dispatcher is built first).
    /// User-registered handlers (`on_restart` etc.) are consulted through
    /// the weak back-reference so a call arriving before a handler is
    /// registered simply finds nothing bound and errors, matching a normal
    /// unbound RPC name.
    fn bind_builtins(universe: &Arc<Universe>, weak: std::sync::Weak<SelfNode>) {
        let dispatcher = universe.dispatcher();

        let w = weak.clone();
        dispatcher.bind("restart", move |_args| {
            if let Some(me) = w.upgrade() {
                if let Some(cb) = me.on_restart.lock().as_ref() {
                    cb();
                    return Ok(Value::Null);
                }
            }
            Err("no restart handler registered".to_string())
        });

        let w = weak.clone();
        dispatcher.bind("shutdown", move |_args| {
            if let Some(me) = w.upgrade() {
                if let Some(cb) = me.on_shutdown.lock().as_ref() {
                    cb();
                    return Ok(Value::Null);
                }
            }
            Err("no shutdown handler registered".to_string())
        });

        let w = weak.clone();
        dispatcher.bind("node_details", move |_args| {
            let me = w.upgrade().ok_or("node shutting down")?;
            let guard = me.on_node_details.lock();
            let cb = guard.as_ref().ok_or("no node_details handler registered")?;
            Ok(cb())
        });

        let w = weak.clone();
        dispatcher.bind("get_cfg", move |args| {
            let path = args.first().and_then(|v| v.as_str()).ok_or("get_cfg requires a path argument")?;
            let me = w.upgrade().ok_or("node shutting down")?;
            let guard = me.on_get_config.lock();
            let cb = guard.as_ref().ok_or("no get_cfg handler registered")?;
            Ok(cb(path))
        });

        let w = weak.clone();
        dispatcher.bind("update_cfg", move |args| {
            if args.len() < 2 {
                return Err("update_cfg requires (path, value)".to_string());
            }
            let path = args[0].as_str().ok_or("update_cfg path must be a string")?;
            let me = w.upgrade().ok_or("node shutting down")?;
            let guard = me.on_set_config.lock();
            let cb = guard.as_ref().ok_or("no update_cfg handler registered")?;
            cb(path, &args[1]);
            Ok(Value::Null)
        });

        let w = weak.clone();
        dispatcher.bind("list_configurables", move |_args| {
            let me = w.upgrade().ok_or("node shutting down")?;
            let guard = me.on_list_config.lock();
            let cb = guard.as_ref().ok_or("no list_configurables handler registered")?;
            Ok(serde_json::to_value(cb()).expect("Vec<String> always serializes"))
        });

        let w = weak.clone();
        dispatcher.bind("create_stream", move |args| {
            if args.len() < 2 {
                return Err("create_stream requires (uri, FrameID)".to_string());
            }
            let uri = args[0].as_str().ok_or("create_stream uri must be a string")?;
            let id: FrameID = serde_json::from_value(args[1].clone()).map_err(|e| e.to_string())?;
            let me = w.upgrade().ok_or("node shutting down")?;
            let guard = me.on_create_stream.lock();
            let cb = guard.as_ref().ok_or("no create_stream handler registered")?;
            cb(uri, id);
            Ok(Value::Null)
        });

        let w = weak.clone();
        dispatcher.bind("find_stream", move |args| {
            let uri = args.first().and_then(|v| v.as_str()).ok_or("find_stream requires a uri argument")?;
            let me = w.upgrade().ok_or("node shutting down")?;
            if me.streams.lock().contains_key(uri) {
                Ok(serde_json::to_value(me.universe.self_uuid()).expect("Uuid always serializes"))
            } else {
                Err(format!("stream not found: {uri}"))
            }
        });

        dispatcher.bind("list_streams", move |_args| {
            let me = weak.upgrade().ok_or("node shutting down")?;
            let uris: Vec<String> = me.streams.lock().keys().cloned().collect();
            Ok(serde_json::to_value(uris).expect("Vec<String> always serializes"))
        });
    }

    /// Wrap every peer the universe registers (inbound or outbound) in a
    /// `Node`, and re-fire our own `onConnect`/`onDisconnect`/`onError`
    /// when that peer's handshake completes or it drops.
    fn wire_peer_hooks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = self.universe.on_new_peer(move |peer| {
            let Some(me) = weak.upgrade() else { return true };
            let node = me.node_for(peer);

            let w1 = weak.clone();
            let n1 = node.clone();
            let h1 = peer.on_connect(move |_| {
                if let Some(me) = w1.upgrade() {
                    me.on_connect.trigger(&n1);
                }
                true
            });

            let w2 = weak.clone();
            let n2 = node.clone();
            let h2 = peer.on_disconnect(move |_| {
                if let Some(me) = w2.upgrade() {
                    me.on_disconnect.trigger(&n2);
                }
                true
            });

            let w3 = weak.clone();
            let n3 = node.clone();
            let h3 = peer.on_error(move |err| {
                if let Some(me) = w3.upgrade() {
                    me.on_error.trigger(&(Some(n3.clone()), err.clone()));
                }
                true
            });

            me.callback_handles.lock().extend([h1, h2, h3]);
            true
        });
        self.callback_handles.lock().push(handle);
    }

    fn node_for(&self, peer: &Arc<Peer>) -> Arc<Node> {
        let mut nodes = self.nodes.lock();
        if let Some(existing) = nodes.iter().find(|n| Arc::ptr_eq(n.peer(), peer)) {
            return existing.clone();
        }
        let node = Node::new(peer.clone());
        nodes.push(node.clone());
        node
    }

    // --- connection lifecycle -------------------------------------------

    /// Open a new listening port via the configured `Connector`.
    pub async fn listen(&self, uri: &str) -> ftl_protocol::Result<()> {
        let parsed = Uri::parse(uri)?;
        let listener = self
            .connector
            .listen(&parsed)
            .await
            .map_err(|e| ProtocolError::new(ErrorKind::Listen, e.to_string()))?;
        self.universe.listen(listener);
        Ok(())
    }

    pub fn get_listening_uris(&self) -> Vec<String> {
        self.universe.get_listening_uris()
    }

    /// Dial another host and wrap the resulting peer in a `Node`. Refuses
    /// to dial our own listener (the self-connect guard) without opening a
    /// socket at all.
    pub async fn connect_node(self: &Arc<Self>, uri: &str) -> ftl_protocol::Result<Arc<Node>> {
        let parsed = Uri::parse(uri)?;
        if self.is_self_address(&parsed) {
            return Err(ProtocolError::new(ErrorKind::SelfConnect, format!("refusing to dial own listener at {uri}")));
        }
        let conn = self
            .connector
            .connect(&parsed)
            .await
            .map_err(|e| ProtocolError::new(ErrorKind::ConnectionFailed, e.to_string()))?;
        let peer = self.universe.connect(conn).await;
        Ok(self.node_for(&peer))
    }

    fn is_self_address(&self, uri: &Uri) -> bool {
        if !matches!(uri.scheme, Scheme::Tcp | Scheme::Ws | Scheme::Wss | Scheme::Ftl) {
            return false;
        }
        let is_loopback = matches!(uri.host.as_str(), "127.0.0.1" | "localhost" | "::1");
        if !is_loopback {
            return false;
        }
        let Some(port) = uri.port else { return false };
        self.universe.get_listening_uris().iter().any(|addr| {
            addr.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()) == Some(port)
        })
    }

    /// Terminate all connections and stop network activity without
    /// destroying this `SelfNode`. Must be called before dropping anything
    /// that registered callbacks or RPC bindings here (matches the
    /// original's documented shutdown contract).
    pub async fn shutdown_self(&self) {
        for peer in self.universe.all_peers() {
            peer.close(false).await;
        }
    }

    pub fn is_connected(&self, uri: &str) -> bool {
        self.nodes.lock().iter().any(|n| n.uri() == uri && n.is_connected())
    }

    pub fn number_of_nodes(&self) -> usize {
        self.universe.number_of_nodes()
    }

    pub fn get_max_connections(&self) -> usize {
        self.universe.max_connections()
    }

    pub fn set_max_connections(&self, max: usize) {
        self.universe.set_max_connections(max);
    }

    /// Block until at least one node has connected, or `seconds` elapses.
    /// Tests should prefer this over busy-polling `is_connected`; production
    /// code should prefer `on_connect`.
    pub async fn wait_connections(&self, seconds: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
        while tokio::time::Instant::now() < deadline {
            if self.nodes.lock().iter().any(|n| n.is_connected()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.nodes.lock().iter().any(|n| n.is_connected())
    }

    pub fn get_node(&self, id: Uuid) -> Option<Arc<Node>> {
        self.nodes.lock().iter().find(|n| n.id() == Some(id)).cloned()
    }

    pub fn get_web_service(&self) -> Option<Arc<Node>> {
        self.web_service.lock().clone()
    }

    /// Mark a connected node as the web service: its `find_stream` answers
    /// become the fallback `NetStream` consumers use once no directly
    /// connected peer answers.
    pub fn set_web_service(&self, node: Arc<Node>) {
        node.mark_web_service();
        *self.web_service.lock() = Some(node);
    }

    pub fn get_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().clone()
    }

    pub fn on_connect<F>(&self, f: F) -> Handle
    where
        F: Fn(&Arc<Node>) -> bool + Send + Sync + 'static,
    {
        self.on_connect.on(f)
    }

    pub fn on_disconnect<F>(&self, f: F) -> Handle
    where
        F: Fn(&Arc<Node>) -> bool + Send + Sync + 'static,
    {
        self.on_disconnect.on(f)
    }

    pub fn on_error<F>(&self, f: F) -> Handle
    where
        F: Fn(&(Option<Arc<Node>>, ProtocolError)) -> bool + Send + Sync + 'static,
    {
        self.on_error.on(f)
    }

    // --- RPC server-side handler registration ---------------------------

    pub fn on_restart<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_restart.lock() = Some(Box::new(f));
    }

    pub fn on_shutdown<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.on_shutdown.lock() = Some(Box::new(f));
    }

    pub fn on_node_details<F>(&self, f: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        *self.on_node_details.lock() = Some(Box::new(f));
    }

    pub fn on_get_config<F>(&self, f: F)
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        *self.on_get_config.lock() = Some(Box::new(f));
    }

    pub fn on_set_config<F>(&self, f: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        *self.on_set_config.lock() = Some(Box::new(f));
    }

    pub fn on_list_config<F>(&self, f: F)
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        *self.on_list_config.lock() = Some(Box::new(f));
    }

    /// Handle a stream-creation request, most likely sent by the web
    /// service asking this node to start hosting `uri` under local address
    /// `id`.
    pub fn on_create_stream<F>(&self, f: F)
    where
        F: Fn(&str, FrameID) + Send + Sync + 'static,
    {
        *self.on_create_stream.lock() = Some(Box::new(f));
    }

    // --- stream factory ---------------------------------------------------

    /// Create (host) or open a stream at `uri`. `ftl://` URIs get a fresh
    /// `NetStream` registered in the discovery registry and begun
    /// immediately; `file://` URIs open the container (reader if it
    /// exists, writer otherwise - left to the caller via `FileStream`
    /// directly, since writer/reader selection needs filesystem access
    /// this facade doesn't otherwise touch).
    pub fn create_stream(self: &Arc<Self>, uri: &str) -> ftl_protocol::Result<Arc<dyn Stream>> {
        let parsed = Uri::parse(uri)?;
        match parsed.scheme {
            Scheme::Ftl => {
                let stream = NetStream::new(uri, self.universe.clone(), self.net_config.clone());
                let dyn_stream: Arc<dyn Stream> = stream;
                self.streams.lock().insert(uri.to_string(), dyn_stream.clone());
                dyn_stream.begin()?;
                Ok(dyn_stream)
            }
            other => Err(ProtocolError::new(
                ErrorKind::BadUri,
                format!("create_stream only builds ftl:// streams directly, got scheme '{}': open file:// streams via FileStream", other.as_str()),
            )),
        }
    }

    /// Look up a stream this process already created/registered by URI.
    pub fn get_stream(&self, uri: &str) -> Option<Arc<dyn Stream>> {
        self.streams.lock().get(uri).cloned()
    }

    /// All streams available to this node: locally hosted ones plus the
    /// union of every connected peer's (and the web service's)
    /// `list_streams` answer.
    pub async fn get_streams(&self) -> Vec<String> {
        let mut all: Vec<String> = self.streams.lock().keys().cloned().collect();
        let remote: Vec<Vec<String>> = self.universe.find_all("list_streams", vec![]).await;
        for list in remote {
            for uri in list {
                if !all.contains(&uri) {
                    all.push(uri);
                }
            }
        }
        all
    }

    /// Find which node provides `uri`, consulting every connected peer and
    /// falling back to the web service if set.
    pub async fn locate_stream(&self, uri: &str) -> Option<Arc<Node>> {
        let found: Option<Uuid> = self.universe.find_one("find_stream", vec![Value::from(uri)]).await;
        if let Some(id) = found {
            if let Some(node) = self.get_node(id) {
                return Some(node);
            }
        }
        self.get_web_service()
    }

    // --- broadcast RPC convenience wrappers -------------------------------

    pub async fn restart_all(&self) {
        self.universe.broadcast("restart", vec![]).await;
    }

    pub async fn shutdown_all(&self) {
        self.universe.broadcast("shutdown", vec![]).await;
    }

    pub async fn get_all_node_details(&self) -> Vec<Value> {
        self.universe.find_all("node_details", vec![]).await
    }
}
