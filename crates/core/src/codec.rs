//! Codec-specific parsing. Only H.264 NAL framing/header parsing is in
//! scope - no encode/decode.

pub mod h264;
