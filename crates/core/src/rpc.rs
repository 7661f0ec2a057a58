//! RPC peer layer: handshake, dispatch, async call correlation.

pub mod dispatcher;
pub mod peer;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use peer::{Peer, PeerId, PeerStatus};
pub use transport::{Connection, Connector, Listener};
