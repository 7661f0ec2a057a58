//! The error taxonomy surfaced through `Stream::onError` / `Peer::onError`.
//!
//! Grounded in `original_source/include/ftl/protocol/error.hpp`: these are
//! reported, not panicked on, so most runtime code carries one of these
//! as data rather than
//! returning `Result<_, Error>` from every call (callbacks can't propagate a
//! `Result` usefully - see `Stream::onError`).

use thiserror::Error;

/// Uncategorised, reported error kind. Mirrors the fixed enum of error
/// kinds the original C++ implementation reports through its own `error()`
/// callback, rather than the open-ended `anyhow::Error` used for glue code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadUri,
    UriAlreadyExists,
    UriDoesNotExist,
    BadHandshake,
    MissingHandshake,
    BadVersion,
    SocketError,
    BufferSize,
    PacketFailure,
    DispatchFailed,
    RpcResponse,
    ReconnectionFailed,
    ConnectionFailed,
    Listen,
    SelfConnect,
    BadParse,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::BadUri => "bad URI",
            ErrorKind::UriAlreadyExists => "URI already exists",
            ErrorKind::UriDoesNotExist => "URI does not exist",
            ErrorKind::BadHandshake => "bad handshake",
            ErrorKind::MissingHandshake => "missing handshake",
            ErrorKind::BadVersion => "bad version",
            ErrorKind::SocketError => "socket error",
            ErrorKind::BufferSize => "buffer size exceeded",
            ErrorKind::PacketFailure => "malformed packet",
            ErrorKind::DispatchFailed => "dispatch failed",
            ErrorKind::RpcResponse => "bad RPC response",
            ErrorKind::ReconnectionFailed => "reconnection failed",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::Listen => "listen failed",
            ErrorKind::SelfConnect => "attempted self connect",
            ErrorKind::BadParse => "parse failure",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(s)
    }
}

/// A reported protocol error: `(kind, human-readable detail)`.
///
/// This is the payload delivered to `onError` callbacks. It also implements
/// `std::error::Error` so it can be threaded through `Result` at call sites
/// that *can* propagate (e.g. `FileStream::open`, `Peer::call`).
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
