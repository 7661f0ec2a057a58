//! Channel addressing.
//!
//! Grounded in `original_source/include/ftl/protocol/channels.hpp`. Bands:
//! video/image `< 32` (mask-addressable in `StreamClient::channels`),
//! audio `32..64`, persistent data `64..2048`, user/control `>= 2048`.
//! `kEndFrame` (2048) terminates all packets for a timestamp.

use serde::{Deserialize, Serialize};

/// A channel identifier. Represented as a plain `u16` wrapper rather than a
/// closed Rust enum: the wire protocol and the original C++ treat this as
/// an open, numeric space (camera option channels, renderer
/// channels, pipeline channels are added without changing the core model),
/// so a closed enum would force an `Unknown(u16)` escape hatch anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(pub u16);

impl Channel {
    // Video / image channels (< 32)
    pub const COLOUR: Channel = Channel(0);
    pub const LEFT: Channel = Channel(0);
    pub const DEPTH: Channel = Channel(1);
    pub const RIGHT: Channel = Channel(2);
    pub const COLOUR2: Channel = Channel(2);
    pub const DEPTH2: Channel = Channel(3);
    pub const SCREEN: Channel = Channel(4);
    pub const NORMALS: Channel = Channel(5);
    pub const WEIGHTS: Channel = Channel(6);
    pub const CONFIDENCE: Channel = Channel(7);
    pub const ENERGY_VECTOR: Channel = Channel(8);
    pub const FLOW: Channel = Channel(9);
    pub const ENERGY: Channel = Channel(10);
    pub const MASK: Channel = Channel(11);
    pub const DENSITY: Channel = Channel(12);
    pub const SUPPORT1: Channel = Channel(13);
    pub const SUPPORT2: Channel = Channel(14);
    pub const SEGMENTATION: Channel = Channel(15);
    pub const NORMALS2: Channel = Channel(16);
    pub const DISPARITY: Channel = Channel(18);
    pub const SMOOTHING: Channel = Channel(19);
    pub const OVERLAY: Channel = Channel(21);
    pub const GROUND_TRUTH: Channel = Channel(22);

    // Audio channels (32..64)
    pub const AUDIO_MONO: Channel = Channel(32);
    pub const AUDIO_STEREO: Channel = Channel(33);
    pub const AUDIO: Channel = Channel(33);

    // Persistent data channels (64..2048)
    pub const CONFIGURATION: Channel = Channel(64);
    pub const CALIBRATION: Channel = Channel(65);
    pub const POSE: Channel = Channel(66);
    pub const CALIBRATION2: Channel = Channel(67);
    pub const INDEX: Channel = Channel(68);
    pub const CONTROL: Channel = Channel(69);
    pub const METADATA: Channel = Channel(71);
    pub const CAPABILITIES: Channel = Channel(72);
    pub const CALIBRATION_DATA: Channel = Channel(73);
    pub const THUMBNAIL: Channel = Channel(74);
    pub const OVERLAY_SELECT: Channel = Channel(75);
    pub const START_TIME: Channel = Channel(76);
    pub const USER: Channel = Channel(77);
    pub const ACCELEROMETER: Channel = Channel(90);
    pub const GYROSCOPE: Channel = Channel(91);

    pub const BRIGHTNESS: Channel = Channel(100);
    pub const CONTRAST: Channel = Channel(101);
    pub const EXPOSURE: Channel = Channel(102);
    pub const GAIN: Channel = Channel(103);
    pub const WHITE_BALANCE: Channel = Channel(104);

    pub const RENDERER_CAMERA_TYPE: Channel = Channel(400);
    pub const RENDERER_VIEW: Channel = Channel(404);
    pub const RENDERER_CHANNEL: Channel = Channel(405);
    pub const RENDERER_SOURCES: Channel = Channel(407);

    pub const PIPELINE_ENABLE: Channel = Channel(500);

    // User / control channels (>= 2048)
    pub const END_FRAME: Channel = Channel(2048);
    pub const FACES: Channel = Channel(2049);
    pub const TRANSFORMS: Channel = Channel(2050);
    pub const SHAPES3D: Channel = Channel(2051);
    pub const MESSAGES: Channel = Channel(2052);
    pub const TOUCH: Channel = Channel(2053);
    pub const PIPELINES: Channel = Channel(2054);

    pub const fn is_video_or_audio(&self) -> bool {
        self.0 < 64
    }

    /// Only video channels are addressable in a `StreamClient` request
    /// bitmask (a `u32` of video channel bits).
    pub const fn is_video(&self) -> bool {
        self.0 < 32
    }

    pub const fn is_audio(&self) -> bool {
        self.0 >= 32 && self.0 < 64
    }

    /// Persistent metadata channels survive between frames rather than
    /// being reset per-timestamp like video/audio planes.
    pub const fn is_persistent(&self) -> bool {
        self.0 >= 64 && self.0 < 2048
    }

    pub const fn is_end_frame(&self) -> bool {
        self.0 == Self::END_FRAME.0
    }

    /// Bit position within a video-channel bitmask, or `None` if this
    /// channel is not mask-addressable.
    pub const fn video_bit(&self) -> Option<u32> {
        if self.is_video() { Some(self.0 as u32) } else { None }
    }

    /// Bit position within a stream's `availableLast`/`availableNext`
    /// video-or-audio bitmask, or `None` for persistent and control
    /// channels which are tracked in a set instead.
    pub const fn av_bit(&self) -> Option<u32> {
        if self.is_video_or_audio() { Some(self.0 as u32) } else { None }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_are_disjoint_and_correct() {
        assert!(Channel::COLOUR.is_video());
        assert!(!Channel::COLOUR.is_persistent());
        assert!(Channel::AUDIO.is_audio());
        assert!(!Channel::AUDIO.is_video());
        assert!(Channel::CALIBRATION.is_persistent());
        assert!(!Channel::CALIBRATION.is_video_or_audio());
        assert!(Channel::END_FRAME.is_end_frame());
        assert!(!Channel::END_FRAME.is_persistent());
    }

    #[test]
    fn end_frame_is_2048() {
        assert_eq!(Channel::END_FRAME.0, 2048);
    }

    #[test]
    fn video_bit_only_for_video_channels() {
        assert_eq!(Channel::DEPTH.video_bit(), Some(1));
        assert_eq!(Channel::CALIBRATION.video_bit(), None);
        assert_eq!(Channel::AUDIO.video_bit(), None);
    }
}
