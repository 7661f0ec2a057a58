//! Packet envelopes.
//!
//! Grounded in `original_source/include/ftl/protocol/packet.hpp`:
//! `StreamPacket` addresses a frame (timestamp/frameset/streamID/frame_number
//! /channel), `DataPacket` carries the codec payload for it. They travel as
//! a pair - the stream packet never appears without its data packet.

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::frame_id::{ALL_FRAMES, ALL_FRAMESETS};

/// Current wire version. Bumped when `StreamPacket`/`DataPacket` layout
/// changes in a way that is not backwards compatible.
pub const FTL_VERSION: u8 = 5;

pub const KALL_FRAMES: u8 = ALL_FRAMES;
pub const KALL_FRAMESETS: u8 = ALL_FRAMESETS;

/// Flags carried in `StreamPacket::flags`.
pub mod stream_flags {
    /// Requesting retransmission / a fresh copy of this channel.
    pub const REQUEST: u8 = 0x01;
    /// This is the final packet of a larger split payload.
    pub const COMPLETED: u8 = 0x02;
    /// Consumer should discard any buffered state and resynchronise.
    pub const RESET: u8 = 0x04;
    /// Key-frame-equivalent: a complete, independently decodable unit.
    pub const FULL: u8 = 0x08;
}

/// Flags carried in `DataPacket::data_flags`.
pub mod data_flags {
    pub const ORIGINAL: u8 = 0x01;
    pub const MULTIPLE: u8 = 0x02;
}

/// Codec identifier for a `DataPacket` payload. `Any`/`Raw` mirror the
/// original's escape hatches for uncompressed or format-agnostic payloads;
/// `H264` is the only codec this crate parses (`crate::codec` is out of
/// scope here - see `ftl-core::codec::h264`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Codec {
    Any = 0,
    Raw = 1,
    H264 = 2,
    Hevc = 3,
    Json = 100,
    MsgPack = 101,
    String = 102,
}

/// Addressing envelope: identifies which frame, frameset and channel a
/// `DataPacket` belongs to. `frame_number` may be `kAllFrames` (255) to mean
/// "applies to every frame in the set" - used by control channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPacket {
    pub version: u8,
    pub timestamp: i64,
    pub streamid: u32,
    pub frame_number: u8,
    pub frameset_id: u8,
    pub channel: Channel,
    pub flags: u8,
}

impl StreamPacket {
    pub fn new(timestamp: i64, streamid: u32, frame_number: u8, channel: Channel) -> Self {
        Self {
            version: FTL_VERSION,
            timestamp,
            streamid,
            frame_number,
            frameset_id: 0,
            channel,
            flags: 0,
        }
    }

    pub const fn is_request(&self) -> bool {
        self.flags & stream_flags::REQUEST != 0
    }

    pub const fn is_completed(&self) -> bool {
        self.flags & stream_flags::COMPLETED != 0
    }

    pub const fn is_reset(&self) -> bool {
        self.flags & stream_flags::RESET != 0
    }

    pub const fn is_full(&self) -> bool {
        self.flags & stream_flags::FULL != 0
    }

    pub const fn matches_all_frames(&self) -> bool {
        self.frame_number == KALL_FRAMES
    }

    /// The packed `(frameset, frame)` identity this packet addresses.
    ///
    /// Versions before 4 packed the frameset id into the high byte of
    /// `streamid`; from version 4 onward `frameset_id` is explicit. We only
    /// ever produce version-5 packets but accept both forms on read, mirroring
    /// `StreamPacket::frameSetID()` in the original header.
    pub fn frameset_id(&self) -> u8 {
        if self.version >= 4 {
            self.frameset_id
        } else {
            (self.streamid >> 8) as u8
        }
    }
}

/// The codec payload and any per-payload flags/bitrate hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    pub codec: Codec,
    pub data_flags: u8,
    /// Index of this fragment when a payload spans multiple `DataPacket`s
    /// (see `data_flags::MULTIPLE`), else 0.
    pub frame_count: u8,
    pub bitrate: u32,
    pub data: Vec<u8>,
}

impl DataPacket {
    pub fn new(codec: Codec, data: Vec<u8>) -> Self {
        Self {
            codec,
            data_flags: data_flags::ORIGINAL,
            frame_count: 1,
            bitrate: 0,
            data,
        }
    }

    pub const fn is_original(&self) -> bool {
        self.data_flags & data_flags::ORIGINAL != 0
    }

    pub const fn is_multiple(&self) -> bool {
        self.data_flags & data_flags::MULTIPLE != 0
    }
}

/// 64-byte index record written at the start of a file stream container.
/// Grounded in `original_source/include/ftl/protocol/packet.hpp`
/// (`IndexHeader`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub reserved: [u8; 64],
}

impl Default for IndexHeader {
    fn default() -> Self {
        Self { reserved: [0u8; 64] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_roundtrip() {
        let mut sp = StreamPacket::new(0, 1, 0, Channel::COLOUR);
        sp.flags = stream_flags::REQUEST | stream_flags::FULL;
        assert!(sp.is_request());
        assert!(sp.is_full());
        assert!(!sp.is_completed());
        assert!(!sp.is_reset());
    }

    #[test]
    fn frame_number_wildcard() {
        let sp = StreamPacket::new(0, 1, KALL_FRAMES, Channel::CONTROL);
        assert!(sp.matches_all_frames());
    }

    #[test]
    fn frameset_id_uses_explicit_field_from_v4() {
        let mut sp = StreamPacket::new(0, 0x0100, 0, Channel::COLOUR);
        sp.version = 5;
        sp.frameset_id = 7;
        assert_eq!(sp.frameset_id(), 7);

        sp.version = 3;
        assert_eq!(sp.frameset_id(), 1);
    }

    #[test]
    fn data_packet_defaults_to_original_single_fragment() {
        let dp = DataPacket::new(Codec::H264, vec![1, 2, 3]);
        assert!(dp.is_original());
        assert!(!dp.is_multiple());
        assert_eq!(dp.frame_count, 1);
    }
}
