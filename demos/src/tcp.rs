//! Minimal TCP `Connection`/`Listener`/`Connector` implementation.
//!
//! `ftl-core` only depends on the `Connection`/`Listener`/`Connector`
//! traits, treating the concrete socket transport as a collaborator out
//! of scope; this is the thin, unencrypted implementation needed to run
//! the facade demo end to end. It is not a
//! production transport - no TLS, no WebSocket framing, no backpressure
//! tuning.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use ftl_core::rpc::{Connection, Connector, Listener};
use ftl_protocol::Uri;

const READ_CHUNK: usize = 64 * 1024;

pub struct TcpConnection {
    addr: String,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpConnection {
    fn new(stream: TcpStream, addr: String) -> Self {
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        Self { addr, reader: Mutex::new(reader), writer: Mutex::new(writer) }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        self.writer.lock().await.write_all(data).await
    }

    async fn recv(&self) -> std::io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self.reader.lock().await.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn close(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    fn peer_addr(&self) -> String {
        self.addr.clone()
    }
}

pub struct TcpListenerImpl {
    listener: TcpListener,
    local_addr: String,
}

#[async_trait]
impl Listener for TcpListenerImpl {
    async fn accept(&self) -> std::io::Result<Box<dyn Connection>> {
        let (stream, addr) = self.listener.accept().await?;
        Ok(Box::new(TcpConnection::new(stream, addr.to_string())))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, uri: &Uri) -> std::io::Result<Box<dyn Connection>> {
        let addr = format!("{}:{}", uri.host, uri.port.unwrap_or(9001));
        let stream = TcpStream::connect(&addr).await?;
        Ok(Box::new(TcpConnection::new(stream, addr)))
    }

    async fn listen(&self, uri: &Uri) -> std::io::Result<Box<dyn Listener>> {
        let addr = format!("{}:{}", uri.host, uri.port.unwrap_or(9001));
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        Ok(Box::new(TcpListenerImpl { listener, local_addr }))
    }
}
