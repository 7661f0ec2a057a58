//! Fan-out stream with no address remapping.
//!
//! Unlike `Muxer`, a `Broadcaster` forwards every `post` verbatim to each
//! child in the order they were added - no frame renumbering, so it's only
//! useful when children already agree on addressing (e.g. duplicating a
//! `Net` stream across two `FileStream` recorders).

use std::sync::Arc;

use parking_lot::RwLock;

use ftl_protocol::{Channel, DataPacket, FrameID, ProtocolError, StreamPacket};

use crate::handle::Handle;
use crate::stream::{PacketCallback, Request, Stream, StreamProperty, StreamState, StreamType};

pub struct Broadcaster {
    state: StreamState,
    children: RwLock<Vec<Arc<dyn Stream>>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self { state: StreamState::new(), children: RwLock::new(Vec::new()) }
    }
}

impl Broadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(self: &Arc<Self>, stream: Arc<dyn Stream>) {
        self.children.write().push(stream.clone());
        let weak_self = Arc::downgrade(self);
        stream.on_packet(Box::new(move |(sp, dp)| {
            if let Some(b) = weak_self.upgrade() {
                b.state.dispatch_packet(sp.clone(), dp.clone());
            }
            true
        }));
    }

    pub fn remove(&self, stream: &Arc<dyn Stream>) {
        self.children.write().retain(|c| !Arc::ptr_eq(c, stream));
    }

    pub fn children(&self) -> Vec<Arc<dyn Stream>> {
        self.children.read().clone()
    }
}

impl Stream for Broadcaster {
    fn post(&self, sp: StreamPacket, dp: DataPacket) -> ftl_protocol::Result<()> {
        for child in self.children.read().iter() {
            child.post(sp, dp.clone())?;
        }
        Ok(())
    }

    fn begin(&self) -> ftl_protocol::Result<()> {
        for child in self.children.read().iter() {
            child.begin()?;
        }
        Ok(())
    }

    fn end(&self) -> ftl_protocol::Result<()> {
        for child in self.children.read().iter() {
            child.end()?;
        }
        Ok(())
    }

    fn active(&self) -> bool {
        let children = self.children.read();
        !children.is_empty() && children.iter().all(|c| c.active())
    }

    fn reset(&self) {
        for child in self.children.read().iter() {
            child.reset();
        }
        self.state.clear();
    }

    fn refresh(&self, req: Request) -> ftl_protocol::Result<()> {
        for child in self.children.read().iter() {
            child.refresh(req)?;
        }
        Ok(())
    }

    fn enable(&self, id: FrameID, channel: Channel) {
        for child in self.children.read().iter() {
            child.enable(id, channel);
        }
    }

    fn disable(&self, id: FrameID, channel: Channel) {
        for child in self.children.read().iter() {
            child.disable(id, channel);
        }
    }

    fn enabled(&self, id: FrameID, channel: Channel) -> bool {
        self.children.read().iter().any(|c| c.enabled(id, channel))
    }

    fn set_property(&self, prop: StreamProperty, value: i64) {
        for child in self.children.read().iter() {
            child.set_property(prop, value);
        }
    }

    fn get_property(&self, prop: StreamProperty) -> Option<i64> {
        self.children.read().first().and_then(|c| c.get_property(prop))
    }

    fn supports_property(&self, prop: StreamProperty) -> bool {
        self.children.read().iter().any(|c| c.supports_property(prop))
    }

    fn stream_type(&self) -> StreamType {
        StreamType::Broadcast
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

    struct CountingStream {
        state: StreamState,
        posts: Mutex<u32>,
        active: bool,
    }

    impl CountingStream {
        fn new(active: bool) -> Arc<Self> {
            Arc::new(Self { state: StreamState::new(), posts: Mutex::new(0), active })
        }
    }

    impl Stream for CountingStream {
        fn post(&self, _sp: StreamPacket, _dp: DataPacket) -> ftl_protocol::Result<()> {
            *self.posts.lock().unwrap() += 1;
            Ok(())
        }
        fn begin(&self) -> ftl_protocol::Result<()> { Ok(()) }
        fn end(&self) -> ftl_protocol::Result<()> { Ok(()) }
        fn active(&self) -> bool { self.active }
        fn reset(&self) {}
        fn refresh(&self, _req: Request) -> ftl_protocol::Result<()> { Ok(()) }
        fn enable(&self, _id: FrameID, _channel: Channel) {}
        fn disable(&self, _id: FrameID, _channel: Channel) {}
        fn enabled(&self, _id: FrameID, _channel: Channel) -> bool { false }
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
    fn post_forwards_to_every_child_verbatim() {
        let b = Broadcaster::new();
        let c1 = CountingStream::new(true);
        let c2 = CountingStream::new(true);
        b.add(c1.clone());
        b.add(c2.clone());

        b.post(StreamPacket::new(0, 0, 0, Channel::COLOUR), DataPacket::new(Codec::H264, vec![])).unwrap();
        assert_eq!(*c1.posts.lock().unwrap(), 1);
        assert_eq!(*c2.posts.lock().unwrap(), 1);
    }

    #[test]
    fn active_is_conjunction_of_children() {
        let b = Broadcaster::new();
        b.add(CountingStream::new(true));
        b.add(CountingStream::new(false));
        assert!(!b.active());
    }

    #[test]
    fn active_false_with_no_children() {
        let b = Broadcaster::new();
        assert!(!b.active());
    }
}
