//! Fan-in address remapping stream.
//!
//! Grounded in `original_source/include/ftl/protocol/muxer.hpp`: a `Muxer`
//! combines several child streams into one by remapping each child's own
//! `(frameset, frame)` numbering onto a single local numbering space, so
//! frames from different sources never collide.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use ftl_protocol::{Channel, DataPacket, ErrorKind, FrameID, ProtocolError, StreamPacket};

use crate::handle::Handle;
use crate::stream::{PacketCallback, Request, Stream, StreamProperty, StreamState, StreamType};

/// Max number of child streams a `Muxer` tracks, mirroring `kMaxStreams` in
/// the original header.
pub const MAX_STREAMS: usize = 5;

type ChildId = usize;

struct StreamEntry {
    stream: Arc<dyn Stream>,
    /// Cancels the child's `on_packet` subscription when the entry is
    /// dropped/removed (`Handle` is cancel-on-drop).
    _packet_handle: Handle,
    fixed_fs: Option<u8>,
    /// Remote frameset -> local frameset, for this child's non-fixed
    /// framesets. Each distinct remote frameset claims its own local
    /// frameset the first time it's observed.
    remote_fs: HashMap<u8, u8>,
    /// child's own (frameset, frame) -> local (frameset, frame)
    imap: HashMap<FrameID, FrameID>,
    /// local (frameset, frame) -> child's own (frameset, frame)
    omap: HashMap<FrameID, FrameID>,
}

struct Inner {
    entries: Vec<StreamEntry>,
    /// local FrameID -> index into `entries`
    fsmap: HashMap<FrameID, ChildId>,
    /// how many distinct sources have been allocated per local frameset
    sourcecount: HashMap<u8, u8>,
    next_local_fs: u8,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            fsmap: HashMap::new(),
            sourcecount: HashMap::new(),
            next_local_fs: 0,
        }
    }
}

/// Combines multiple child streams into one, remapping addresses so frames
/// from distinct children never collide in the muxed space. A write must be
/// preceded by a read (a packet received from the child) for that child's
/// mapping to exist - the original documents the same precondition.
pub struct Muxer {
    state: StreamState,
    inner: RwLock<Inner>,
}

impl Default for Muxer {
    fn default() -> Self {
        Self { state: StreamState::new(), inner: RwLock::new(Inner::default()) }
    }
}

impl Muxer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a child stream. `fixed_fs` pins every frame from this child into
    /// a single local frameset (different frames become different sources
    /// within it); omit it to allocate a fresh local frameset per child
    /// frameset as it is first observed.
    pub fn add(self: &Arc<Self>, stream: Arc<dyn Stream>, fixed_fs: Option<u8>) -> ftl_protocol::Result<()> {
        let idx = {
            let inner = self.inner.read();
            if inner.entries.len() >= MAX_STREAMS {
                return Err(ProtocolError::new(ErrorKind::BadParse, "muxer at max child stream capacity"));
            }
            inner.entries.len()
        };

        let weak_self = Arc::downgrade(self);
        let packet_handle = stream.on_packet(Box::new(move |(sp, dp)| {
            if let Some(muxer) = weak_self.upgrade() {
                muxer.handle_child_packet(idx, sp.clone(), dp.clone());
            }
            true
        }));

        self.inner.write().entries.push(StreamEntry {
            stream,
            _packet_handle: packet_handle,
            fixed_fs,
            remote_fs: HashMap::new(),
            imap: HashMap::new(),
            omap: HashMap::new(),
        });
        Ok(())
    }

    pub fn remove(&self, stream: &Arc<dyn Stream>) {
        let mut inner = self.inner.write();
        if let Some(idx) = inner.entries.iter().position(|e| Arc::ptr_eq(&e.stream, stream)) {
            inner.entries.remove(idx);
            inner.fsmap.retain(|_, child| *child != idx);
        }
    }

    fn handle_child_packet(&self, child: ChildId, sp: StreamPacket, dp: DataPacket) {
        let local_id = {
            let mut inner = self.inner.write();
            if inner.entries.get(child).is_none() {
                return;
            }
            let remote = FrameID::new(sp.frameset_id(), sp.frame_number);
            if let Some(&local) = inner.entries[child].imap.get(&remote) {
                local
            } else {
                // Fixed-frameset children get freshly allocated source indices
                // out of a counter shared by every child pinned to that
                // frameset. Non-fixed children each distinct remote frameset
                // claims the next never-used local frameset, and the remote
                // source id is preserved unchanged.
                let local = if let Some(fixed) = inner.entries[child].fixed_fs {
                    let source = *inner.sourcecount.entry(fixed).or_insert(0);
                    inner.sourcecount.insert(fixed, source + 1);
                    FrameID::new(fixed, source)
                } else {
                    let local_fs = if let Some(&fs) = inner.entries[child].remote_fs.get(&remote.frameset) {
                        fs
                    } else {
                        let fs = inner.next_local_fs;
                        inner.next_local_fs = inner.next_local_fs.wrapping_add(1);
                        inner.entries[child].remote_fs.insert(remote.frameset, fs);
                        fs
                    };
                    FrameID::new(local_fs, remote.source)
                };

                let entry = &mut inner.entries[child];
                entry.imap.insert(remote, local);
                entry.omap.insert(local, remote);
                inner.fsmap.insert(local, child);
                local
            }
        };

        let mut remapped = sp;
        remapped.frameset_id = local_id.frameset;
        remapped.frame_number = local_id.source;
        self.state.dispatch_packet(remapped, dp);
    }

    /// The child stream originally responsible for `id`, if any.
    pub fn origin_stream(&self, id: FrameID) -> Option<Arc<dyn Stream>> {
        let inner = self.inner.read();
        inner.fsmap.get(&id).map(|&idx| inner.entries[idx].stream.clone())
    }

    /// The child-local id corresponding to a muxer-local id, if mapped.
    pub fn find_remote(&self, id: FrameID) -> Option<FrameID> {
        let inner = self.inner.read();
        let idx = *inner.fsmap.get(&id)?;
        inner.entries[idx].omap.get(&id).copied()
    }

    pub fn streams(&self) -> Vec<Arc<dyn Stream>> {
        self.inner.read().entries.iter().map(|e| e.stream.clone()).collect()
    }
}

impl Stream for Muxer {
    fn post(&self, sp: StreamPacket, dp: DataPacket) -> ftl_protocol::Result<()> {
        let local = FrameID::new(sp.frameset_id(), sp.frame_number);
        let (child_idx, remote) = {
            let inner = self.inner.read();
            let idx = *inner
                .fsmap
                .get(&local)
                .ok_or_else(|| ProtocolError::new(ErrorKind::UriDoesNotExist, "no child mapped for this frame id"))?;
            let remote = *inner.entries[idx].omap.get(&local).unwrap();
            (idx, remote)
        };
        let mut out = sp;
        out.frameset_id = remote.frameset;
        out.frame_number = remote.source;
        let stream = self.inner.read().entries[child_idx].stream.clone();
        stream.post(out, dp)
    }

    fn begin(&self) -> ftl_protocol::Result<()> {
        for entry in &self.inner.read().entries {
            entry.stream.begin()?;
        }
        Ok(())
    }

    fn end(&self) -> ftl_protocol::Result<()> {
        for entry in &self.inner.read().entries {
            entry.stream.end()?;
        }
        Ok(())
    }

    fn active(&self) -> bool {
        self.inner.read().entries.iter().any(|e| e.stream.active())
    }

    fn reset(&self) {
        let mut inner = self.inner.write();
        for entry in &mut inner.entries {
            entry.stream.reset();
            entry.imap.clear();
            entry.omap.clear();
            entry.remote_fs.clear();
        }
        inner.fsmap.clear();
        inner.sourcecount.clear();
        inner.next_local_fs = 0;
        self.state.clear();
    }

    fn refresh(&self, req: Request) -> ftl_protocol::Result<()> {
        let inner = self.inner.read();
        if let Some(&idx) = inner.fsmap.get(&req.id) {
            let remote = *inner.entries[idx].omap.get(&req.id).unwrap();
            let stream = inner.entries[idx].stream.clone();
            drop(inner);
            return stream.refresh(Request { id: remote, ..req });
        }
        // Wildcard request (255/255): broadcast to every child.
        if req.id.is_wildcard() {
            for entry in &inner.entries {
                let _ = entry.stream.refresh(req);
            }
        }
        Ok(())
    }

    fn enable(&self, id: FrameID, channel: Channel) {
        let inner = self.inner.read();
        if id.is_wildcard() {
            for entry in &inner.entries {
                entry.stream.enable(FrameID::all(), channel);
            }
            return;
        }
        if let Some(&idx) = inner.fsmap.get(&id) {
            let remote = *inner.entries[idx].omap.get(&id).unwrap();
            inner.entries[idx].stream.enable(remote, channel);
        }
    }

    fn disable(&self, id: FrameID, channel: Channel) {
        let inner = self.inner.read();
        if let Some(&idx) = inner.fsmap.get(&id) {
            let remote = *inner.entries[idx].omap.get(&id).unwrap();
            inner.entries[idx].stream.disable(remote, channel);
        }
    }

    fn enabled(&self, id: FrameID, channel: Channel) -> bool {
        let inner = self.inner.read();
        inner.fsmap.get(&id).is_some_and(|&idx| {
            let remote = *inner.entries[idx].omap.get(&id).unwrap();
            inner.entries[idx].stream.enabled(remote, channel)
        })
    }

    fn set_property(&self, prop: StreamProperty, value: i64) {
        for entry in &self.inner.read().entries {
            entry.stream.set_property(prop, value);
        }
    }

    fn get_property(&self, prop: StreamProperty) -> Option<i64> {
        self.inner.read().entries.first().and_then(|e| e.stream.get_property(prop))
    }

    fn supports_property(&self, prop: StreamProperty) -> bool {
        self.inner.read().entries.iter().any(|e| e.stream.supports_property(prop))
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Muxer
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
    use ftl_protocol::Codec;
    use std::sync::Mutex;

    struct FakeStream {
        state: StreamState,
        posted: Mutex<Vec<(StreamPacket, DataPacket)>>,
    }

    impl FakeStream {
        fn new() -> Arc<Self> {
            Arc::new(Self { state: StreamState::new(), posted: Mutex::new(Vec::new()) })
        }

        fn emit(&self, sp: StreamPacket, dp: DataPacket) {
            self.state.dispatch_packet(sp, dp);
        }
    }

    impl Stream for FakeStream {
        fn post(&self, sp: StreamPacket, dp: DataPacket) -> ftl_protocol::Result<()> {
            self.posted.lock().unwrap().push((sp, dp));
            Ok(())
        }
        fn begin(&self) -> ftl_protocol::Result<()> { Ok(()) }
        fn end(&self) -> ftl_protocol::Result<()> { Ok(()) }
        fn active(&self) -> bool { true }
        fn reset(&self) {}
        fn refresh(&self, _req: Request) -> ftl_protocol::Result<()> { Ok(()) }
        fn enable(&self, _id: FrameID, _channel: Channel) {}
        fn disable(&self, _id: FrameID, _channel: Channel) {}
        fn enabled(&self, _id: FrameID, _channel: Channel) -> bool { true }
        fn set_property(&self, _prop: StreamProperty, _value: i64) {}
        fn get_property(&self, _prop: StreamProperty) -> Option<i64> { None }
        fn supports_property(&self, _prop: StreamProperty) -> bool { false }
        fn stream_type(&self) -> StreamType { StreamType::Net }
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

    #[test]
    fn remaps_child_frame_into_fixed_frameset() {
        let muxer = Muxer::new();
        let child = FakeStream::new();
        muxer.add(child.clone(), Some(3)).unwrap();

        let sp = StreamPacket::new(0, 0, 0, Channel::COLOUR);
        child.emit(sp, DataPacket::new(Codec::H264, vec![]));

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let _h: Handle = Stream::on_packet(muxer.as_ref(), Box::new(move |(sp, _)| {
            *seen2.lock().unwrap() = Some((sp.frameset_id, sp.frame_number));
            true
        }));

        let sp2 = StreamPacket::new(1, 0, 1, Channel::COLOUR);
        child.emit(sp2, DataPacket::new(Codec::H264, vec![]));
        assert_eq!(*seen.lock().unwrap(), Some((3, 1)));
    }

    #[test]
    fn post_routes_to_correct_child_with_remapped_address() {
        let muxer = Muxer::new();
        let child = FakeStream::new();
        muxer.add(child.clone(), Some(0)).unwrap();

        child.emit(StreamPacket::new(0, 0, 5, Channel::COLOUR), DataPacket::new(Codec::H264, vec![]));

        let local_id = FrameID::new(0, 0);
        muxer.post(StreamPacket::new(0, 0, local_id.source, Channel::COLOUR), DataPacket::new(Codec::H264, vec![9])).unwrap();

        let posted = child.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0.frame_number, 5);
    }

    #[test]
    fn distinct_remote_framesets_without_fixed_fs_get_distinct_local_framesets() {
        let muxer = Muxer::new();
        let child = FakeStream::new();
        muxer.add(child.clone(), None).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _h: Handle = Stream::on_packet(muxer.as_ref(), Box::new(move |(sp, _)| {
            seen2.lock().unwrap().push((sp.frameset_id, sp.frame_number));
            true
        }));

        // Two distinct remote framesets from the same child, each with
        // source 3, must not collide: source ids are preserved unchanged.
        let mut sp0 = StreamPacket::new(0, 0, 3, Channel::COLOUR);
        sp0.frameset_id = 0;
        let mut sp1 = StreamPacket::new(0, 0, 3, Channel::COLOUR);
        sp1.frameset_id = 1;
        child.emit(sp0, DataPacket::new(Codec::H264, vec![]));
        child.emit(sp1, DataPacket::new(Codec::H264, vec![]));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (0, 3));
        assert_eq!(seen[1], (1, 3));
        assert_ne!(seen[0].0, seen[1].0);
    }

    #[test]
    fn origin_stream_resolves_back_to_child() {
        let muxer = Muxer::new();
        let child = FakeStream::new();
        muxer.add(child.clone(), Some(0)).unwrap();
        child.emit(StreamPacket::new(0, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![]));

        let origin = muxer.origin_stream(FrameID::new(0, 0)).unwrap();
        assert!(Arc::ptr_eq(&origin, &(child as Arc<dyn Stream>)));
    }
}
