//! Runtime for the FTL peer-to-peer streaming protocol.
//!
//! Builds on the wire-level data model in `ftl_protocol` to provide the
//! stream abstraction and its composition operators (`Muxer`,
//! `Broadcaster`), the network stream (`NetStream`) and file stream
//! (`FileStream`) concrete implementations, the RPC `Peer`/`Universe` layer,
//! and the H.264 NAL parser used to classify video payloads.

pub mod codec;
pub mod handle;
pub mod net_stream;
pub mod packet_manager;
pub mod rpc;
pub mod self_node;
pub mod stream;

mod broadcaster;
mod file_stream;
mod muxer;
mod universe;

pub use broadcaster::Broadcaster;
pub use file_stream::FileStream;
pub use muxer::Muxer;
pub use net_stream::{NetStats, NetStream, StreamClient};
pub use packet_manager::PacketManager;
pub use self_node::{Node, NodeType, SelfNode};
pub use stream::{PacketCallback, Request, Stream, StreamProperty, StreamState, StreamType};
pub use universe::{PeerHandle, Universe};

pub use ftl_protocol::config::{FileConfig, ListenConfig, NetConfig, NodeConfig};
pub use ftl_protocol::{Channel, Codec, DataPacket, ErrorKind, FrameID, ProtocolError, StreamPacket};

/// Default size of the small fixed worker pool dispatch work runs on.
/// `tokio`'s multi-threaded runtime plays that role here; this constant
/// documents the intended parallelism rather than configuring a separate
/// pool.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default maximum number of peers a `Universe` tracks.
pub const DEFAULT_MAX_PEERS: usize = 10;

/// Default periodic reconnect/garbage-collect interval.
pub const DEFAULT_PERIODIC_INTERVAL_MS: u64 = 1000;
