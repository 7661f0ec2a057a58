//! Per-`FrameID` packet ordering.
//!
//! Grounded in `original_source/src/packet_manager.cpp`: used by `NetStream`
//! to enforce per-timestamp delivery order for a `FrameID` when the
//! buffering thread isn't already doing that job. Each `FrameID` gets its
//! own ring of up to 100 packets that have arrived ahead of the timestamp
//! currently being assembled.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use ftl_protocol::{Channel, DataPacket, FrameID, StreamPacket};

/// Ring capacity per `FrameID`.
const RING_CAPACITY: usize = 100;
/// More than this many end-frame packets buffered ahead of the current
/// timestamp means the current frame is abandoned as incomplete.
const MAX_BUFFERED_END_FRAMES: usize = 4;

struct FrameState {
    /// -1 means "no packet has been submitted for this FrameID yet".
    timestamp: i64,
    /// Set once an end-frame packet for the current timestamp is seen;
    /// `None` means we don't yet know how many packets complete this frame.
    expected: Option<u32>,
    processed: u32,
    buffered: VecDeque<(StreamPacket, DataPacket)>,
}

impl FrameState {
    fn new() -> Self {
        Self {
            timestamp: -1,
            expected: None,
            processed: 0,
            buffered: VecDeque::new(),
        }
    }

    fn buffered_end_frames(&self) -> usize {
        self.buffered.iter().filter(|(sp, _)| sp.channel.is_end_frame()).count()
    }

    fn min_buffered_timestamp(&self) -> Option<i64> {
        self.buffered.iter().map(|(sp, _)| sp.timestamp).min()
    }

    /// Remove and return every buffered packet at or below `ts`, oldest
    /// arrival first.
    fn drain_at_or_below(&mut self, ts: i64) -> Vec<(StreamPacket, DataPacket)> {
        let mut drained = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.buffered.len());
        for entry in self.buffered.drain(..) {
            if entry.0.timestamp <= ts {
                drained.push(entry);
            } else {
                remaining.push_back(entry);
            }
        }
        self.buffered = remaining;
        drained
    }

    fn complete(&mut self) -> bool {
        self.expected.is_some_and(|e| self.processed >= e)
    }

    /// Reset bookkeeping for the current timestamp and advance to whatever
    /// the oldest buffered timestamp is, draining everything at or below it
    /// into `out`. Cascades: a drained packet may itself complete the new
    /// timestamp, in which case we advance again.
    fn advance_and_drain(&mut self, out: &mut Vec<(StreamPacket, DataPacket)>) {
        loop {
            self.processed = 0;
            self.expected = None;
            let Some(min_ts) = self.min_buffered_timestamp() else { break };
            self.timestamp = min_ts;
            for (sp, dp) in self.drain_at_or_below(min_ts) {
                self.processed += 1;
                if sp.channel.is_end_frame() {
                    self.expected = Some(dp.frame_count as u32);
                }
                out.push((sp, dp));
            }
            if !self.complete() {
                break;
            }
        }
    }
}

/// Orders packets within each `FrameID` before they're handed to `onPacket`
/// callbacks.
pub struct PacketManager {
    states: Mutex<HashMap<FrameID, FrameState>>,
}

impl Default for PacketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketManager {
    pub fn new() -> Self {
        Self { states: Mutex::new(HashMap::new()) }
    }

    /// Submit one packet for ordering. Returns the packets (zero or more,
    /// in delivery order) that should be dispatched now.
    pub fn submit(&self, spkt: StreamPacket, pkt: DataPacket) -> Vec<(StreamPacket, DataPacket)> {
        let key = FrameID::new(spkt.frameset_id(), spkt.frame_number);
        let mut states = self.states.lock();
        let state = states.entry(key).or_insert_with(FrameState::new);

        // The very first packet for a FrameID seeds `timestamp` rather than
        // matching any of the three comparison branches below (`-1` never
        // equals, is never "less than", and is explicitly excluded from the
        // "greater than" branch).
        if state.timestamp == -1 {
            state.timestamp = spkt.timestamp;
        }

        let mut out = Vec::new();
        if spkt.timestamp == state.timestamp {
            state.processed += 1;
            let is_end_frame = spkt.channel.is_end_frame();
            if is_end_frame {
                state.expected = Some(pkt.frame_count as u32);
            }
            out.push((spkt, pkt));
            if state.complete() {
                state.advance_and_drain(&mut out);
            }
        } else if spkt.timestamp > state.timestamp {
            let is_end_frame = spkt.channel.is_end_frame();
            if state.buffered.len() >= RING_CAPACITY {
                tracing::warn!(frame = %key, "packet manager ring full, dropping oldest buffered packet");
                state.buffered.pop_front();
            }
            state.buffered.push_back((spkt, pkt));
            if is_end_frame && state.buffered_end_frames() > MAX_BUFFERED_END_FRAMES {
                tracing::debug!(frame = %key, "frame declared incomplete, skipping ahead");
                state.advance_and_drain(&mut out);
            }
        } else {
            // Late arrival behind the current timestamp: deliver anyway,
            // state is not rewound.
            out.push((spkt, pkt));
        }
        out
    }

    /// Drop all state for a `FrameID`, e.g. on a `kFlagReset` packet.
    pub fn reset(&self, id: FrameID) {
        self.states.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_protocol::Codec;

    fn packet(ts: i64, channel: Channel) -> (StreamPacket, DataPacket) {
        (StreamPacket::new(ts, 1, 0, channel), DataPacket::new(Codec::H264, vec![1]))
    }

    fn end_frame(ts: i64, count: u8) -> (StreamPacket, DataPacket) {
        let mut dp = DataPacket::new(Codec::Raw, vec![]);
        dp.frame_count = count;
        (StreamPacket::new(ts, 1, 0, Channel::END_FRAME), dp)
    }

    #[test]
    fn first_packet_dispatches_immediately() {
        let mgr = PacketManager::new();
        let (sp, dp) = packet(10, Channel::COLOUR);
        let out = mgr.submit(sp, dp);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn complete_frame_advances_to_next_buffered_timestamp() {
        let mgr = PacketManager::new();
        // Frame 10: one data packet then an end-frame declaring 2 expected.
        let (sp, dp) = packet(10, Channel::COLOUR);
        assert_eq!(mgr.submit(sp, dp).len(), 1);

        // Packets for frame 11 arrive early and get buffered.
        let (sp11, dp11) = packet(11, Channel::COLOUR);
        assert!(mgr.submit(sp11, dp11).is_empty());

        // End-frame for 10 completes it (processed=2 == expected=2) and
        // should drain the buffered frame-11 packet immediately after.
        let (sp_end, dp_end) = end_frame(10, 2);
        let out = mgr.submit(sp_end, dp_end);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0.timestamp, 10);
        assert_eq!(out[1].0.timestamp, 11);
    }

    #[test]
    fn late_arrival_is_dispatched_without_rewinding_state() {
        let mgr = PacketManager::new();
        let (sp, dp) = packet(10, Channel::COLOUR);
        mgr.submit(sp, dp);
        // Advance to 11 via an end-frame with expected=1 (only the one packet).
        let (sp_end, dp_end) = end_frame(10, 1);
        mgr.submit(sp_end, dp_end);

        let (sp_late, dp_late) = packet(5, Channel::COLOUR);
        let out = mgr.submit(sp_late, dp_late);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.timestamp, 5);
    }

    #[test]
    fn more_than_four_buffered_end_frames_skips_incomplete_current_frame() {
        let mgr = PacketManager::new();
        let (sp, dp) = packet(0, Channel::COLOUR);
        mgr.submit(sp, dp); // seeds timestamp=0, never completes

        for ts in 1..=5 {
            let (sp_end, dp_end) = end_frame(ts, 99); // never reaches `expected`
            let out = mgr.submit(sp_end, dp_end);
            if ts <= 4 {
                assert!(out.is_empty(), "timestamp {ts} should just buffer");
            } else {
                // The 5th buffered end-frame pushes us over the limit and
                // forces an advance away from the stuck timestamp=0 frame.
                assert!(!out.is_empty(), "5th end-frame should force an advance");
            }
        }
    }

    #[test]
    fn reset_clears_frame_state() {
        let mgr = PacketManager::new();
        let (sp, dp) = packet(10, Channel::COLOUR);
        mgr.submit(sp, dp);
        mgr.reset(FrameID::new(0, 0));
        let (sp2, dp2) = packet(3, Channel::COLOUR);
        // A fresh FrameID state means 3 seeds timestamp again (not "late").
        let out = mgr.submit(sp2, dp2);
        assert_eq!(out.len(), 1);
    }
}
