//! Network-backed stream.
//!
//! Grounded in `original_source/src/streams/netstream.cpp`. One `NetStream`
//! plays both roles the original's single `Net` class plays depending on
//! how it's used: host (advertises a URI, fans packets out to requesting
//! clients) when `post()` is called, consumer (resolves a host, requests
//! channels, buffers incoming packets) when `enable()` is called.
//!
//! Deviation from the literal wire shape (see DESIGN.md): `Dispatcher`
//! bindings here don't carry sender identity, so every notification on a
//! stream's URI carries the sender's peer uuid as an explicit fourth
//! argument - `(ttimeoff, StreamPacket, DataPacket, sender_uuid)` rather
//! than a bare three-element form.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use ftl_protocol::config::NetConfig;
use ftl_protocol::packet::stream_flags;
use ftl_protocol::{Channel, Codec, DataPacket, ErrorKind, FrameID, ProtocolError, StreamPacket};

use crate::handle::Handle;
use crate::packet_manager::PacketManager;
use crate::rpc::Peer;
use crate::stream::{PacketCallback, Request, Stream, StreamPacketExt, StreamProperty, StreamState, StreamType};
use crate::universe::Universe;

/// How many frames the remote commits to send before a consumer must
/// re-request (mirrors the original's `frames_to_request_`).
const FRAMES_TO_REQUEST: i64 = 30;
/// Per-tick growth/shrink step for the adaptive receive buffer, in ms.
const BUFFER_STEP_MS: i64 = 20;
/// Floor below which the adaptive receive buffer never shrinks, in ms.
const BUFFER_FLOOR_MS: i64 = 5;
/// Buffering thread tick interval.
const TICK_INTERVAL_MS: u64 = 5;

fn now_ms() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i64
}

/// Global TX/RX byte counters, exposed via `NetStats::global().get_statistics()`
/// - mirrors the original's static `getStatistics()`.
pub struct NetStats {
    tx_bytes: std::sync::atomic::AtomicU64,
    rx_bytes: std::sync::atomic::AtomicU64,
    last_tx: std::sync::atomic::AtomicU64,
    last_rx: std::sync::atomic::AtomicU64,
    last_sample: Mutex<Instant>,
}

impl NetStats {
    pub fn global() -> &'static NetStats {
        static INSTANCE: OnceLock<NetStats> = OnceLock::new();
        INSTANCE.get_or_init(|| NetStats {
            tx_bytes: std::sync::atomic::AtomicU64::new(0),
            rx_bytes: std::sync::atomic::AtomicU64::new(0),
            last_tx: std::sync::atomic::AtomicU64::new(0),
            last_rx: std::sync::atomic::AtomicU64::new(0),
            last_sample: Mutex::new(Instant::now()),
        })
    }

    pub fn record_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Mbps (tx, rx) since the last call to this method.
    pub fn get_statistics(&self) -> (f64, f64) {
        let mut last = self.last_sample.lock();
        let elapsed = last.elapsed().as_secs_f64().max(0.001);
        let tx = self.tx_bytes.load(Ordering::Relaxed);
        let rx = self.rx_bytes.load(Ordering::Relaxed);
        let dtx = tx.saturating_sub(self.last_tx.swap(tx, Ordering::Relaxed));
        let drx = rx.saturating_sub(self.last_rx.swap(rx, Ordering::Relaxed));
        *last = Instant::now();
        (mbps(dtx, elapsed), mbps(drx, elapsed))
    }
}

fn mbps(bytes: u64, seconds: f64) -> f64 {
    (bytes as f64 * 8.0 / 1_000_000.0) / seconds
}

/// Host-side bookkeeping for one `(FrameID, requesting peer)` pair.
pub struct StreamClient {
    pub peer: Arc<Peer>,
    pub frame: FrameID,
    txcount: AtomicI64,
    /// Bitmask of requested video channels (bit N set = channel N wanted).
    channels: AtomicU32,
}

impl StreamClient {
    fn new(peer: Arc<Peer>, frame: FrameID) -> Arc<Self> {
        Arc::new(Self { peer, frame, txcount: AtomicI64::new(0), channels: AtomicU32::new(0) })
    }

    pub fn txcount(&self) -> i64 {
        self.txcount.load(Ordering::SeqCst)
    }

    pub fn channels_mask(&self) -> u32 {
        self.channels.load(Ordering::SeqCst)
    }

    fn bump_txcount(&self, at_least: i64) {
        self.txcount.fetch_max(at_least, Ordering::SeqCst);
    }

    fn enable_channel(&self, bit: u32) {
        self.channels.fetch_or(1 << bit, Ordering::SeqCst);
    }

    fn wants_channel(&self, channel: Channel) -> bool {
        match channel.video_bit() {
            Some(bit) => self.channels_mask() & (1 << bit) != 0,
            None => true,
        }
    }

    /// Returns the post-decrement count.
    fn decrement_on_end_frame(&self) -> i64 {
        self.txcount.fetch_sub(1, Ordering::SeqCst) - 1
    }
}

/// Per-`FrameID` holdback queue for the adaptive jitter buffer. Packets
/// arrive already ordered and frame-completed by `PacketManager`; this
/// queue only delays their release until `buffering_ms` has elapsed since
/// the frame's first packet, absorbing network jitter.
struct ReceiveQueue {
    ts_base_local: Option<i64>,
    ts_base_spkt: Option<i64>,
    packets: VecDeque<(StreamPacket, DataPacket, i64)>,
}

impl ReceiveQueue {
    fn new() -> Self {
        Self { ts_base_local: None, ts_base_spkt: None, packets: VecDeque::new() }
    }
}

/// A named, network-backed stream: `ftl://host/name`. See module docs for
/// the host/consumer role split.
pub struct NetStream {
    state: StreamState,
    uri: String,
    universe: Arc<Universe>,
    self_weak: Mutex<Weak<NetStream>>,

    // Host-role state.
    clients: Mutex<HashMap<(FrameID, Uuid), Arc<StreamClient>>>,
    known_frames: Mutex<HashSet<FrameID>>,

    // Consumer-role state.
    host_peer: Mutex<Option<Arc<Peer>>>,
    web_service_peer: Mutex<Option<Arc<Peer>>>,
    tally: Mutex<HashMap<u8, i64>>,
    enabled_channels: Mutex<HashSet<(FrameID, Channel)>>,
    queues: Mutex<HashMap<FrameID, ReceiveQueue>>,
    buffering_ms: AtomicI64,
    rtt_ms: AtomicI64,
    buffering_started: AtomicBool,
    stop: Arc<Notify>,
    packet_manager: PacketManager,

    properties: Mutex<HashMap<StreamProperty, i64>>,
    active: AtomicBool,
    #[allow(dead_code)]
    config: NetConfig,
}

impl NetStream {
    pub fn new(uri: impl Into<String>, universe: Arc<Universe>, config: NetConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<NetStream>| Self {
            state: StreamState::new(),
            uri: uri.into(),
            universe,
            self_weak: Mutex::new(weak.clone()),
            clients: Mutex::new(HashMap::new()),
            known_frames: Mutex::new(HashSet::new()),
            host_peer: Mutex::new(None),
            web_service_peer: Mutex::new(None),
            tally: Mutex::new(HashMap::new()),
            enabled_channels: Mutex::new(HashSet::new()),
            queues: Mutex::new(HashMap::new()),
            buffering_ms: AtomicI64::new(BUFFER_FLOOR_MS),
            rtt_ms: AtomicI64::new(50),
            buffering_started: AtomicBool::new(false),
            stop: Arc::new(Notify::new()),
            packet_manager: PacketManager::new(),
            properties: Mutex::new(HashMap::new()),
            active: AtomicBool::new(false),
            config,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Configure a fallback peer for host resolution when no connected peer
    /// answers `find_stream` (the original's "configured web-service
    /// peer").
    pub fn set_web_service_peer(&self, peer: Option<Arc<Peer>>) {
        *self.web_service_peer.lock() = peer;
    }

    fn weak(&self) -> Weak<NetStream> {
        self.self_weak.lock().clone()
    }

    fn bind_uri(&self) {
        let weak = self.weak();
        let uri = self.uri.clone();
        self.universe.dispatcher().bind(uri, move |args| {
            let Some(stream) = weak.upgrade() else {
                return Err("stream dropped".to_string());
            };
            stream.handle_incoming(args).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        });
    }

    fn handle_incoming(&self, args: &[Value]) -> ftl_protocol::Result<()> {
        if args.len() < 4 {
            return Err(ProtocolError::new(ErrorKind::PacketFailure, "short net stream notification"));
        }
        let sp: StreamPacket = serde_json::from_value(args[1].clone())
            .map_err(|e| ProtocolError::new(ErrorKind::PacketFailure, e.to_string()))?;
        let dp: DataPacket = serde_json::from_value(args[2].clone())
            .map_err(|e| ProtocolError::new(ErrorKind::PacketFailure, e.to_string()))?;
        let sender: Uuid = serde_json::from_value(args[3].clone())
            .map_err(|e| ProtocolError::new(ErrorKind::PacketFailure, e.to_string()))?;

        NetStats::global().record_rx(dp.data.len());
        if sp.is_request() {
            self.process_request(sender, sp, dp);
        } else {
            self.ingest(sp, dp);
        }
        Ok(())
    }

    // ---- Host role ----

    fn process_request(&self, sender: Uuid, sp: StreamPacket, dp: DataPacket) {
        let Some(peer) = self.universe.find_peer_by_uuid(sender) else {
            tracing::warn!(%sender, "stream request from unrecognised peer, ignoring");
            return;
        };
        let requested = sp.frame_number_id();
        let targets: Vec<FrameID> = if requested.is_wildcard() {
            self.known_frames.lock().iter().copied().filter(|id| requested.matches(*id)).collect()
        } else {
            vec![requested]
        };

        for id in targets {
            let client = {
                let mut clients = self.clients.lock();
                clients.entry((id, sender)).or_insert_with(|| StreamClient::new(peer.clone(), id)).clone()
            };
            client.bump_txcount(dp.frame_count as i64);
            if let Some(bit) = sp.channel.video_bit() {
                client.enable_channel(bit);
            }
            self.state.dispatch_request(Request {
                id,
                channel: sp.channel,
                bitrate: dp.bitrate,
                count: dp.frame_count as u32,
                codec: dp.codec,
            });
        }
    }

    fn fan_out(&self, sp: StreamPacket, dp: DataPacket) {
        self.known_frames.lock().insert(sp.frame_number_id());
        let frame = sp.frame_number_id();
        let recipients: Vec<Arc<StreamClient>> =
            self.clients.lock().values().filter(|c| c.frame == frame).cloned().collect();
        let is_end_frame = sp.channel.is_end_frame();

        for client in &recipients {
            let outgoing = if sp.channel.is_video() && !client.wants_channel(sp.channel) {
                DataPacket { data: Vec::new(), ..dp.clone() }
            } else {
                dp.clone()
            };
            NetStats::global().record_tx(outgoing.data.len());
            let args = vec![
                Value::from(0i64),
                serde_json::to_value(sp).expect("StreamPacket always serializes"),
                serde_json::to_value(&outgoing).expect("DataPacket always serializes"),
                serde_json::to_value(self.universe.self_uuid()).expect("uuid always serializes"),
            ];
            let peer = client.peer.clone();
            let uri = self.uri.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.notify(uri, args).await {
                    tracing::warn!(error = %e, "net stream fan-out send failed");
                }
            });
            if is_end_frame {
                client.decrement_on_end_frame();
            }
        }

        if is_end_frame {
            self.clients.lock().retain(|_, c| c.txcount() > 0);
        }
    }

    // ---- Consumer role ----

    async fn resolve_host_peer(self: &Arc<Self>) -> Option<Arc<Peer>> {
        if let Some(p) = self.host_peer.lock().clone() {
            return Some(p);
        }
        let found: Option<Uuid> = self.universe.find_one("find_stream", vec![Value::from(self.uri.clone())]).await;
        let peer = found
            .and_then(|uuid| self.universe.find_peer_by_uuid(uuid))
            .or_else(|| self.web_service_peer.lock().clone());
        if let Some(peer) = &peer {
            *self.host_peer.lock() = Some(peer.clone());
            self.measure_rtt(peer).await;
        }
        peer
    }

    async fn measure_rtt(&self, peer: &Arc<Peer>) {
        let start = Instant::now();
        if peer.call::<i64>("__ping__", vec![]).await.is_ok() {
            self.rtt_ms.store(start.elapsed().as_millis().max(1) as i64, Ordering::SeqCst);
        }
    }

    async fn send_request(&self, peer: Arc<Peer>, fs: u8, src: u8, channel: Channel, count: u32, bitrate: u32, reset: bool) {
        let mut sp = StreamPacket::new(0, 0, src, channel);
        sp.frameset_id = fs;
        sp.flags = stream_flags::REQUEST | if reset { stream_flags::RESET } else { 0 };
        let mut dp = DataPacket::new(Codec::Any, Vec::new());
        dp.frame_count = count.min(u8::MAX as u32) as u8;
        dp.bitrate = bitrate;
        let args = vec![
            Value::from(0i64),
            serde_json::to_value(sp).expect("StreamPacket always serializes"),
            serde_json::to_value(&dp).expect("DataPacket always serializes"),
            serde_json::to_value(self.universe.self_uuid()).expect("uuid always serializes"),
        ];
        if let Err(e) = peer.notify(self.uri.clone(), args).await {
            tracing::warn!(error = %e, "failed to send stream request");
        }
    }

    fn enable_consumer(self: &Arc<Self>, id: FrameID, channel: Channel) {
        self.enabled_channels.lock().insert((id, channel));
        self.tally.lock().entry(id.frameset).or_insert(FRAMES_TO_REQUEST);
        self.ensure_buffering_thread();

        let stream = self.clone();
        tokio::spawn(async move {
            let _ = stream.universe.broadcast("enable_stream", vec![Value::from(stream.uri.clone())]).await;
            if let Some(peer) = stream.resolve_host_peer().await {
                stream.send_request(peer, id.frameset, id.source, channel, FRAMES_TO_REQUEST as u32, 0, false).await;
            } else {
                tracing::warn!(uri = %stream.uri, "no peer hosts this stream");
            }
        });
    }

    fn ingest(self: &Arc<Self>, sp: StreamPacket, dp: DataPacket) {
        if sp.channel.is_end_frame() {
            self.on_end_frame_tally(sp.frameset_id());
        }

        let id = sp.frame_number_id();
        // PacketManager enforces per-timestamp ordering and completion;
        // it may return nothing (still assembling), one packet (in-order
        // arrival), or a cascade of several (a buffered frame completing
        // and unblocking frames behind it).
        let ready = self.packet_manager.submit(sp, dp);
        if ready.is_empty() {
            return;
        }

        let now = now_ms();
        let mut queues = self.queues.lock();
        let q = queues.entry(id).or_insert_with(ReceiveQueue::new);
        q.ts_base_local.get_or_insert(now);
        for (rsp, rdp) in ready {
            let ts_base_spkt = *q.ts_base_spkt.get_or_insert(rsp.timestamp);
            let ts_rel = rsp.timestamp - ts_base_spkt;
            q.packets.push_back((rsp, rdp, ts_rel));
        }
    }

    fn on_end_frame_tally(self: &Arc<Self>, fs: u8) {
        let should_refresh = {
            let mut tally = self.tally.lock();
            let entry = tally.entry(fs).or_insert(FRAMES_TO_REQUEST);
            *entry -= 1;
            *entry <= FRAMES_TO_REQUEST / 2
        };
        if !should_refresh {
            return;
        }
        let targets: Vec<(FrameID, Channel)> =
            self.enabled_channels.lock().iter().copied().filter(|(id, _)| id.frameset == fs).collect();
        if targets.is_empty() {
            return;
        }
        let stream = self.clone();
        tokio::spawn(async move {
            let Some(peer) = stream.host_peer.lock().clone() else { return };
            for (id, channel) in targets {
                stream
                    .send_request(peer.clone(), id.frameset, id.source, channel, FRAMES_TO_REQUEST as u32, 0, false)
                    .await;
            }
            *stream.tally.lock().entry(fs).or_insert(FRAMES_TO_REQUEST) = FRAMES_TO_REQUEST;
        });
    }

    fn ensure_buffering_thread(self: &Arc<Self>) {
        if self.buffering_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self.clone();
        tokio::spawn(async move { stream.run_buffering_loop().await });
    }

    async fn run_buffering_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(TICK_INTERVAL_MS)) => {}
                _ = self.stop.notified() => break,
            }
            let released = self.release_due_packets(now_ms());
            if released.is_empty() {
                self.record_underrun();
            } else {
                self.maybe_shrink_buffer();
                self.dispatch_batch(released);
            }
        }
    }

    /// Releases every already-ordered packet whose `ts_rel + buffering` has
    /// come due, per `FrameID`. Completion was already decided by
    /// `PacketManager` on ingest, so this only gates on elapsed time.
    fn release_due_packets(&self, now: i64) -> Vec<(StreamPacket, DataPacket)> {
        let buffering_ms = self.buffering_ms.load(Ordering::SeqCst);
        let mut out = Vec::new();
        let mut queues = self.queues.lock();
        for q in queues.values_mut() {
            let Some(ts_base_local) = q.ts_base_local else { continue };
            let elapsed = now - ts_base_local;
            let mut remaining = VecDeque::with_capacity(q.packets.len());
            while let Some(item) = q.packets.pop_front() {
                if item.2 + buffering_ms <= elapsed {
                    out.push((item.0, item.1));
                } else {
                    remaining.push_back(item);
                }
            }
            q.packets = remaining;
        }
        out
    }

    fn dispatch_batch(self: &Arc<Self>, mut batch: Vec<(StreamPacket, DataPacket)>) {
        batch.sort_by_key(|(sp, _)| (sp.timestamp, sp.channel.is_end_frame()));
        let (video, rest): (Vec<_>, Vec<_>) = batch.into_iter().partition(|(sp, _)| sp.channel.is_video());
        for (sp, dp) in video {
            let stream = self.clone();
            tokio::spawn(async move { stream.state.dispatch_packet(sp, dp) });
        }
        for (sp, dp) in rest {
            self.state.dispatch_packet(sp, dp);
        }
    }

    fn record_underrun(&self) {
        let cap = self.buffer_cap_ms();
        let current = self.buffering_ms.load(Ordering::SeqCst);
        let grown = (current + BUFFER_STEP_MS).min(cap).max(BUFFER_FLOOR_MS);
        self.buffering_ms.store(grown, Ordering::SeqCst);
    }

    fn maybe_shrink_buffer(&self) {
        let cap = self.buffer_cap_ms();
        let current = self.buffering_ms.load(Ordering::SeqCst);
        if (current as f64) > (cap as f64) * 1.33 {
            let shrunk = (current - BUFFER_STEP_MS).max(BUFFER_FLOOR_MS);
            self.buffering_ms.store(shrunk, Ordering::SeqCst);
        }
    }

    fn buffer_cap_ms(&self) -> i64 {
        (self.rtt_ms.load(Ordering::SeqCst) as f64 * 2.1) as i64
    }

    pub fn current_buffering_ms(&self) -> i64 {
        self.buffering_ms.load(Ordering::SeqCst)
    }
}

impl Stream for NetStream {
    fn post(&self, sp: StreamPacket, dp: DataPacket) -> ftl_protocol::Result<()> {
        self.fan_out(sp, dp);
        Ok(())
    }

    fn begin(&self) -> ftl_protocol::Result<()> {
        self.active.store(true, Ordering::SeqCst);
        self.bind_uri();
        let universe = self.universe.clone();
        let uri = self.uri.clone();
        tokio::spawn(async move { universe.broadcast("add_stream", vec![Value::from(uri)]).await });
        Ok(())
    }

    fn end(&self) -> ftl_protocol::Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.universe.dispatcher().unbind(&self.uri);
        self.stop.notify_waiters();
        self.clients.lock().clear();
        Ok(())
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.clients.lock().clear();
        self.known_frames.lock().clear();
        self.queues.lock().clear();
        self.tally.lock().clear();
        self.state.clear();
    }

    fn refresh(&self, req: Request) -> ftl_protocol::Result<()> {
        if let Some(peer) = self.host_peer.lock().clone() {
            let weak = self.weak();
            tokio::spawn(async move {
                if let Some(stream) = weak.upgrade() {
                    let count = if req.count > 0 { req.count } else { FRAMES_TO_REQUEST as u32 };
                    stream.send_request(peer, req.id.frameset, req.id.source, req.channel, count, req.bitrate, true).await;
                }
            });
        }
        Ok(())
    }

    fn enable(&self, id: FrameID, channel: Channel) {
        if let Some(stream) = self.self_weak.lock().upgrade() {
            stream.enable_consumer(id, channel);
        }
    }

    fn disable(&self, id: FrameID, channel: Channel) {
        self.enabled_channels.lock().remove(&(id, channel));
    }

    fn enabled(&self, id: FrameID, channel: Channel) -> bool {
        self.enabled_channels.lock().contains(&(id, channel))
    }

    fn set_property(&self, prop: StreamProperty, value: i64) {
        self.properties.lock().insert(prop, value);
    }

    fn get_property(&self, prop: StreamProperty) -> Option<i64> {
        self.properties.lock().get(&prop).copied()
    }

    fn supports_property(&self, _prop: StreamProperty) -> bool {
        true
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Net
    }

    fn on_packet(&self, f: Box<dyn Fn(&PacketCallback) -> bool + Send + Sync>) -> Handle {
        self.state.on_packet(move |args| f(args))
    }

    fn on_request(&self, f: Box<dyn Fn(&Request) -> bool + Send + Sync>) -> Handle {
        self.state.on_request(move |args| f(args))
    }

    fn on_error(&self, f: Box<dyn Fn(&ProtocolError) -> bool + Send + Sync>) -> Handle {
        self.state.on_error(move |args| f(args))
    }

    fn state(&self) -> &StreamState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_client_tracks_requested_channels() {
        let peer_uuid = Uuid::new_v4();
        let _ = peer_uuid;
        let client = StreamClient { peer: unsafe_test_peer(), frame: FrameID::new(0, 0), txcount: AtomicI64::new(0), channels: AtomicU32::new(0) };
        client.bump_txcount(10);
        client.bump_txcount(5); // lower value must not shrink txcount
        assert_eq!(client.txcount(), 10);
        client.enable_channel(Channel::COLOUR.video_bit().unwrap());
        assert!(client.wants_channel(Channel::COLOUR));
        assert!(!client.wants_channel(Channel::DEPTH));
        assert!(client.wants_channel(Channel::CONTROL)); // non-video always forwarded
    }

    #[test]
    fn net_stats_reports_zero_with_no_traffic() {
        let (tx, rx) = NetStats::global().get_statistics();
        assert!(tx >= 0.0);
        assert!(rx >= 0.0);
    }

    #[test]
    fn buffer_floor_and_cap_bound_adaptive_growth() {
        // Constructing a full NetStream needs a Universe; this checks the
        // pure numeric policy in isolation instead.
        let rtt = 50i64;
        let cap = (rtt as f64 * 2.1) as i64;
        let mut current = BUFFER_FLOOR_MS;
        for _ in 0..20 {
            current = (current + BUFFER_STEP_MS).min(cap).max(BUFFER_FLOOR_MS);
        }
        assert_eq!(current, cap);
    }

    // Building a `StreamClient` directly in a unit test needs a live `Peer`,
    // which needs a `Connection`; a minimal no-op stub keeps this test
    // self-contained without a socket.
    fn unsafe_test_peer() -> Arc<Peer> {
        use crate::rpc::Dispatcher;
        use async_trait::async_trait;

        struct NullConnection;
        #[async_trait]
        impl crate::rpc::Connection for NullConnection {
            async fn send(&self, _data: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
            async fn recv(&self) -> std::io::Result<Option<Vec<u8>>> {
                std::future::pending().await
            }
            async fn close(&self) -> std::io::Result<()> {
                Ok(())
            }
            fn peer_addr(&self) -> String {
                "null".to_string()
            }
        }

        Peer::new(Box::new(NullConnection), Dispatcher::new(), Uuid::new_v4())
    }
}
