//! Transport abstraction the RPC layer depends on.
//!
//! The concrete socket transport (TCP/TLS/WebSocket/QUIC) is an
//! out-of-scope collaborator - `ftl-core` only depends on these two
//! traits. `demos/` supplies a minimal TCP implementation to exercise the
//! facade end to end.

use async_trait::async_trait;

/// A single duplex byte connection to a remote peer.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, data: &[u8]) -> std::io::Result<()>;

    /// Read the next chunk of bytes, or `Ok(None)` on clean EOF.
    async fn recv(&self) -> std::io::Result<Option<Vec<u8>>>;

    async fn close(&self) -> std::io::Result<()>;

    /// Human-readable remote address, for logging.
    fn peer_addr(&self) -> String;
}

/// Accepts inbound connections on some bound address.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> std::io::Result<Box<dyn Connection>>;

    /// The address actually bound, e.g. after an ephemeral port was
    /// requested - used to populate `Self::get_listening_uris`.
    fn local_addr(&self) -> String;
}

/// Resolves a `tcp://`/`ws://`/`wss://` URI into a live connection or
/// listener. This is the thin factory the `Self` facade's `connectNode`/
/// `listen` need without pulling a concrete socket implementation into
/// `ftl-core` - `demos/` supplies one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &ftl_protocol::Uri) -> std::io::Result<Box<dyn Connection>>;

    async fn listen(&self, uri: &ftl_protocol::Uri) -> std::io::Result<Box<dyn Listener>>;
}
