//! The `Stream` trait and its shared per-frame bookkeeping.
//!
//! Grounded in `original_source/include/ftl/protocol/streams.hpp`: the base
//! class factors request/packet/error callback state out of the pure
//! virtual `post`/`begin`/`end`/`active` methods so concrete streams only
//! implement the transport-specific part.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use ftl_protocol::{Channel, Codec, DataPacket, FrameID, ProtocolError, StreamPacket};

use crate::handle::{Handle, Handler};

/// Requests a stream send/resend a channel for a frame, carrying the
/// negotiated bitrate/frame-count/codec the request was made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub id: FrameID,
    pub channel: Channel,
    pub bitrate: u32,
    pub count: u32,
    pub codec: Codec,
}

pub type PacketCallback = (StreamPacket, DataPacket);

/// Properties settable/gettable on a stream without a full packet round
/// trip (bitrate target, quality hint, and similar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamProperty {
    Bitrate,
    Quality,
    Latency,
    FrameRate,
    /// `kLooping`: whether a file reader restarts at EOF (video only).
    Looping,
    /// `kSpeed`: playback speed multiplier for a file reader.
    Speed,
    /// `kURI`: the stream's address. Not representable as `i64` - fetched
    /// through `Stream::property_uri` instead of `get_property`.
    Uri,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Net,
    File,
    Muxer,
    Broadcast,
}

/// Per-`FrameID` bookkeeping a concrete stream consults to decide whether a
/// frame set is active and which channels are available. Created lazily on first reference
/// (`HashMap::entry`) and never destroyed until the stream ends
/// (`StreamState::clear`/`reset_frameset`).
#[derive(Debug, Default, Clone)]
pub struct FrameSetState {
    /// Whether at least one packet has ever been dispatched for this frame.
    pub active: bool,
    /// Whether a consumer has asked for this frame (`enable`/`disable`).
    pub enabled: bool,
    /// Channels a consumer has explicitly asked for.
    pub selected: HashSet<Channel>,
    /// Bitmask of video/audio channels seen in the previous complete frame.
    pub available_last: u64,
    /// Bitmask being built for the frame currently in flight.
    pub available_next: u64,
    /// Persistent (metadata) channels ever observed; these never expire.
    pub available_persistent: HashSet<Channel>,
}

/// Shared state every concrete stream embeds: the frame-set map and the
/// callback lists for packets/requests/errors. Concrete streams delegate
/// `on_packet`/`on_request`/`on_error` registration here and consult
/// `fs_state` from their own `post`/`begin`/`end` implementations.
pub struct StreamState {
    fs_state: RwLock<HashMap<FrameID, FrameSetState>>,
    packet_handler: std::sync::Arc<Handler<PacketCallback>>,
    request_handler: std::sync::Arc<Handler<Request>>,
    error_handler: std::sync::Arc<Handler<ProtocolError>>,
    available_handler: std::sync::Arc<Handler<FrameID>>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            fs_state: RwLock::new(HashMap::new()),
            packet_handler: Handler::new(),
            request_handler: Handler::new(),
            error_handler: Handler::new(),
            available_handler: Handler::new(),
        }
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_packet<F>(&self, f: F) -> Handle
    where
        F: Fn(&PacketCallback) -> bool + Send + Sync + 'static,
    {
        self.packet_handler.on(f)
    }

    pub fn on_request<F>(&self, f: F) -> Handle
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.request_handler.on(f)
    }

    pub fn on_error<F>(&self, f: F) -> Handle
    where
        F: Fn(&ProtocolError) -> bool + Send + Sync + 'static,
    {
        self.error_handler.on(f)
    }

    pub fn on_available<F>(&self, f: F) -> Handle
    where
        F: Fn(&FrameID) -> bool + Send + Sync + 'static,
    {
        self.available_handler.on(f)
    }

    pub fn dispatch_packet(&self, sp: StreamPacket, dp: DataPacket) {
        self.seen(sp.frame_number_id(), sp.channel);
        self.packet_handler.trigger(&(sp, dp));
    }

    pub fn dispatch_request(&self, req: Request) {
        self.request_handler.trigger(&req);
    }

    pub fn dispatch_error(&self, err: ProtocolError) {
        self.error_handler.trigger(&err);
    }

    pub fn dispatch_available(&self, id: FrameID) {
        self.available_handler.trigger(&id);
    }

    /// The sole mutator of per-frame availability.
    /// `kEndFrame` commits `availableNext` into `availableLast` and resets
    /// the in-flight accumulator; persistent channels join a set that never
    /// expires; transient (video/audio) channels set a bit in the in-flight
    /// accumulator. The availability callback fires only when something
    /// newly became available - a persistent channel's first sighting ever,
    /// or a transient channel's first sighting within the current frame.
    pub fn seen(&self, id: FrameID, channel: Channel) {
        let mut newly_available = false;
        {
            let mut state = self.fs_state.write();
            let entry = state.entry(id).or_default();
            entry.active = true;
            if channel.is_end_frame() {
                entry.available_last = entry.available_next;
                entry.available_next = 0;
            } else if channel.is_persistent() {
                newly_available = entry.available_persistent.insert(channel);
            } else if let Some(bit) = channel.av_bit() {
                let mask = 1u64 << bit;
                if entry.available_next & mask == 0 {
                    entry.available_next |= mask;
                    newly_available = true;
                }
            }
        }
        if newly_available {
            self.dispatch_available(id);
        }
    }

    /// True if `channel` has been observed for `id`, either in the previous
    /// complete frame (transient) or ever (persistent).
    pub fn available(&self, id: FrameID, channel: Channel) -> bool {
        let state = self.fs_state.read();
        let Some(s) = state.get(&id) else { return false };
        if channel.is_persistent() {
            s.available_persistent.contains(&channel)
        } else if let Some(bit) = channel.av_bit() {
            s.available_last & (1u64 << bit) != 0
        } else {
            false
        }
    }

    /// Every channel available for `id`: the persistent set plus whichever
    /// video/audio bits were set in the previous complete frame.
    pub fn channels(&self, id: FrameID) -> Vec<Channel> {
        let state = self.fs_state.read();
        let Some(s) = state.get(&id) else { return Vec::new() };
        let mut out: Vec<Channel> = s.available_persistent.iter().copied().collect();
        for bit in 0..64u32 {
            if s.available_last & (1u64 << bit) != 0 {
                out.push(Channel(bit as u16));
            }
        }
        out
    }

    /// Idempotently mark `id` enabled and add `channel` to its selected set.
    pub fn enable(&self, id: FrameID, channel: Channel) {
        let mut state = self.fs_state.write();
        let entry = state.entry(id).or_default();
        entry.enabled = true;
        entry.selected.insert(channel);
    }

    /// Remove `channel` from the selected set; clears `enabled` once the
    /// selected set is empty.
    pub fn disable(&self, id: FrameID, channel: Channel) {
        let mut state = self.fs_state.write();
        if let Some(entry) = state.get_mut(&id) {
            entry.selected.remove(&channel);
            if entry.selected.is_empty() {
                entry.enabled = false;
            }
        }
    }

    pub fn is_enabled(&self, id: FrameID) -> bool {
        self.fs_state.read().get(&id).is_some_and(|s| s.enabled)
    }

    pub fn is_selected(&self, id: FrameID, channel: Channel) -> bool {
        self.fs_state.read().get(&id).is_some_and(|s| s.selected.contains(&channel))
    }

    /// Every frame ever referenced, known or enabled.
    pub fn frames(&self) -> Vec<FrameID> {
        self.fs_state.read().keys().copied().collect()
    }

    /// Every currently-enabled frame, optionally restricted to one frameset.
    pub fn enabled_frames(&self, frameset: Option<u8>) -> Vec<FrameID> {
        self.fs_state
            .read()
            .iter()
            .filter(|(id, s)| s.enabled && frameset.is_none_or(|fs| id.frameset == fs))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_active(&self, id: FrameID) -> bool {
        self.fs_state.read().get(&id).is_some_and(|s| s.active)
    }

    pub fn reset_frameset(&self, id: FrameID) {
        self.fs_state.write().remove(&id);
    }

    pub fn clear(&self) {
        self.fs_state.write().clear();
    }
}

/// `StreamPacket` doesn't carry a `FrameID` directly on the wire (it has
/// separate `frameset_id`/`frame_number` fields); this helper builds one for
/// use as a bookkeeping key.
pub trait StreamPacketExt {
    fn frame_number_id(&self) -> FrameID;
}

impl StreamPacketExt for StreamPacket {
    fn frame_number_id(&self) -> FrameID {
        FrameID::new(self.frameset_id(), self.frame_number)
    }
}

/// Common interface implemented by `Net`, `FileStream`, `Muxer` and
/// `Broadcaster`. Mirrors `ftl::protocol::Stream` in
/// `original_source/include/ftl/protocol/streams.hpp`.
pub trait Stream: Send + Sync {
    /// Send a packet. Implementations decide how to route it (network
    /// send, file append, fan-out to children).
    fn post(&self, sp: StreamPacket, dp: DataPacket) -> ftl_protocol::Result<()>;

    /// Start the stream (connect/open/activate children).
    fn begin(&self) -> ftl_protocol::Result<()>;

    /// Stop the stream.
    fn end(&self) -> ftl_protocol::Result<()>;

    /// Whether the stream is currently producing or accepting data.
    fn active(&self) -> bool;

    /// Drop all per-frameset bookkeeping state and request a fresh start.
    fn reset(&self);

    /// Request a fresh copy of a channel for a frame (used by consumers to
    /// ask a producer to resend).
    fn refresh(&self, req: Request) -> ftl_protocol::Result<()>;

    fn enable(&self, id: FrameID, channel: Channel);
    fn disable(&self, id: FrameID, channel: Channel);
    fn enabled(&self, id: FrameID, channel: Channel) -> bool;

    fn set_property(&self, prop: StreamProperty, value: i64);
    fn get_property(&self, prop: StreamProperty) -> Option<i64>;
    fn supports_property(&self, prop: StreamProperty) -> bool;

    /// String-valued properties (currently only `kURI`), which don't fit
    /// `get_property`'s `i64` value. Defaults to `None`; override for any
    /// property whose capability check (`supports_property`) passes.
    fn property_uri(&self) -> Option<String> {
        None
    }

    fn stream_type(&self) -> StreamType;

    fn on_packet(&self, f: Box<dyn Fn(&PacketCallback) -> bool + Send + Sync>) -> Handle;
    fn on_request(&self, f: Box<dyn Fn(&Request) -> bool + Send + Sync>) -> Handle;
    fn on_error(&self, f: Box<dyn Fn(&ProtocolError) -> bool + Send + Sync>) -> Handle;

    /// The shared per-frame bookkeeping every concrete stream embeds.
    /// Backs the default `available`/`channels`/`frames` queries below.
    fn state(&self) -> &StreamState;

    /// Query over `availableLast ∪ availablePersistent`.
    fn available(&self, id: FrameID, channel: Channel) -> bool {
        self.state().available(id, channel)
    }

    /// Union of the persistent set and the bits from `availableLast`.
    fn channels(&self, id: FrameID) -> Vec<Channel> {
        self.state().channels(id)
    }

    /// Every frame ever referenced on this stream.
    fn frames(&self) -> Vec<FrameID> {
        self.state().frames()
    }

    /// Every enabled frame, optionally restricted to one frameset.
    fn enabled_frames(&self, frameset: Option<u8>) -> Vec<FrameID> {
        self.state().enabled_frames(frameset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_protocol::Codec;

    #[test]
    fn dispatch_packet_marks_frameset_active_and_records_channel() {
        let state = StreamState::new();
        let id = FrameID::new(0, 1);
        assert!(!state.is_active(id));

        let sp = StreamPacket::new(0, 0, 1, Channel::COLOUR);
        let dp = DataPacket::new(Codec::H264, vec![]);
        state.dispatch_packet(sp, dp);

        assert!(state.is_active(id));
    }

    #[test]
    fn packet_callback_receives_dispatched_packet() {
        let state = StreamState::new();
        let received = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let received2 = received.clone();
        let _h = state.on_packet(move |(sp, _dp)| {
            *received2.lock() = Some(sp.channel);
            true
        });

        let sp = StreamPacket::new(0, 0, 0, Channel::DEPTH);
        state.dispatch_packet(sp, DataPacket::new(Codec::Raw, vec![]));
        assert_eq!(*received.lock(), Some(Channel::DEPTH));
    }

    #[test]
    fn reset_frameset_clears_active_flag() {
        let state = StreamState::new();
        let id = FrameID::new(2, 3);
        state.dispatch_packet(StreamPacket::new(0, 0, 3, Channel::COLOUR), DataPacket::new(Codec::Raw, vec![]));
        let _ = id;
        let fs_id = FrameID::new(StreamPacket::new(0, 0, 3, Channel::COLOUR).frameset_id(), 3);
        assert!(state.is_active(fs_id));
        state.reset_frameset(fs_id);
        assert!(!state.is_active(fs_id));
    }

    // Availability determinism: a channel only becomes available once its
    // frame's end-frame marker commits availableNext into availableLast.
    #[test]
    fn available_after_post_and_end_frame() {
        let state = StreamState::new();
        let id = FrameID::new(0, 0);

        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![1]));
        assert!(!state.available(id, Channel::COLOUR), "not available until the frame's end-frame arrives");

        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::END_FRAME), DataPacket::new(Codec::Any, vec![]));
        assert!(state.available(id, Channel::COLOUR));
    }

    #[test]
    fn transient_channel_not_carried_into_next_frame_unless_reposted() {
        let state = StreamState::new();
        let id = FrameID::new(0, 0);

        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![1]));
        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::END_FRAME), DataPacket::new(Codec::Any, vec![]));
        assert!(state.available(id, Channel::COLOUR));

        // A new timestamp's end-frame with nothing posted in between clears it.
        state.dispatch_packet(StreamPacket::new(50, 0, 0, Channel::END_FRAME), DataPacket::new(Codec::Any, vec![]));
        assert!(!state.available(id, Channel::COLOUR));
    }

    #[test]
    fn persistent_channel_survives_across_frames_once_seen() {
        let state = StreamState::new();
        let id = FrameID::new(0, 0);

        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::CALIBRATION), DataPacket::new(Codec::Json, vec![1]));
        assert!(state.available(id, Channel::CALIBRATION), "persistent channels are available immediately, no end-frame needed");

        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::END_FRAME), DataPacket::new(Codec::Any, vec![]));
        state.dispatch_packet(StreamPacket::new(50, 0, 0, Channel::END_FRAME), DataPacket::new(Codec::Any, vec![]));
        assert!(state.available(id, Channel::CALIBRATION), "persistent channels never expire");
    }

    #[test]
    fn availability_callback_fires_once_per_frame_for_transient_channel() {
        let state = StreamState::new();
        let count = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let count2 = count.clone();
        let _h = state.on_available(move |_id| {
            count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        });

        let id = FrameID::new(0, 0);
        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![1]));
        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![2]));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1, "second post of the same channel this frame is not newly available");

        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::END_FRAME), DataPacket::new(Codec::Any, vec![]));
        state.dispatch_packet(StreamPacket::new(50, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![3]));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2, "next frame's first post is newly available again");
    }

    #[test]
    fn enable_disable_tracks_selected_set() {
        let state = StreamState::new();
        let id = FrameID::new(0, 0);
        assert!(!state.is_enabled(id));

        state.enable(id, Channel::COLOUR);
        state.enable(id, Channel::DEPTH);
        assert!(state.is_enabled(id));
        assert!(state.is_selected(id, Channel::COLOUR));

        state.disable(id, Channel::COLOUR);
        assert!(state.is_enabled(id), "still enabled while DEPTH remains selected");
        state.disable(id, Channel::DEPTH);
        assert!(!state.is_enabled(id), "enabled clears once the selected set empties");
    }

    #[test]
    fn channels_unions_persistent_set_with_available_last_bitmask() {
        let state = StreamState::new();
        let id = FrameID::new(0, 0);
        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![1]));
        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::CALIBRATION), DataPacket::new(Codec::Json, vec![1]));
        state.dispatch_packet(StreamPacket::new(0, 0, 0, Channel::END_FRAME), DataPacket::new(Codec::Any, vec![]));

        let channels = state.channels(id);
        assert!(channels.contains(&Channel::COLOUR));
        assert!(channels.contains(&Channel::CALIBRATION));
    }
}
