//! Wire-level data model for the FTL peer-to-peer streaming protocol:
//! addressing, packet envelopes, the RPC message shape and node config.
//! Runtime behaviour (streams, muxing, RPC dispatch, codecs) lives in
//! `ftl-core`, which depends on this crate.

pub mod channel;
pub mod config;
pub mod error;
pub mod frame_id;
pub mod packet;
pub mod uri;
pub mod wire;

pub use channel::Channel;
pub use config::{FileConfig, ListenConfig, NetConfig, NodeConfig};
pub use error::{ErrorKind, ProtocolError, Result};
pub use frame_id::FrameID;
pub use packet::{Codec, DataPacket, IndexHeader, StreamPacket};
pub use uri::{Scheme, Uri};
pub use wire::{Handshake, Message};
