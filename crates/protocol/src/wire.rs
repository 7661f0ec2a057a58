//! RPC wire messages. Grounded in `original_source/src/peer.hpp`.
//!
//! Three message shapes, discriminated by the leading tag matching the
//! original msgpack-rpc-derived protocol: `0` call, `1` response, `2`
//! notification. Calls and responses correlate through `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Magic sent by both peers at the start of a handshake, before any
/// `Message` is exchanged.
pub const HANDSHAKE_MAGIC: u64 = 0x0009_3400_5364_0912;

/// Protocol version negotiated at handshake time. A peer whose version
/// doesn't match rejects the connection (`ErrorKind::BadVersion`).
pub const HANDSHAKE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic: u64,
    pub version: u32,
}

impl Handshake {
    pub fn current() -> Self {
        Self {
            magic: HANDSHAKE_MAGIC,
            version: HANDSHAKE_VERSION,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == HANDSHAKE_MAGIC && self.version == HANDSHAKE_VERSION
    }
}

/// An RPC message exchanged between two connected peers once the handshake
/// has completed. Tagged so that `[0, id, name, args]` / `[1, id, error,
/// result]` / `[2, name, args]` on the wire map onto a single Rust type
/// without a manual tuple-based decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Message {
    /// `[0, id, name, args]` - a call expecting a `Response` with the same id.
    #[serde(rename = "0")]
    Call { id: u32, name: String, args: Vec<Value> },
    /// `[1, id, error, result]` - the reply to a `Call`. Exactly one of
    /// `error`/`result` carries data; the original protocol does not use a
    /// Rust-style `Result` encoding on the wire.
    #[serde(rename = "1")]
    Response {
        id: u32,
        error: Option<String>,
        result: Option<Value>,
    },
    /// `[2, name, args]` - fire-and-forget, no response expected.
    #[serde(rename = "2")]
    Notification { name: String, args: Vec<Value> },
}

impl Message {
    pub fn call(id: u32, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Call { id, name: name.into(), args }
    }

    pub fn ok_response(id: u32, result: Value) -> Self {
        Self::Response { id, error: None, result: Some(result) }
    }

    pub fn err_response(id: u32, error: impl Into<String>) -> Self {
        Self::Response { id, error: Some(error.into()), result: None }
    }

    pub fn notification(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Notification { name: name.into(), args }
    }

    /// The correlation id, if this message carries one.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Call { id, .. } | Self::Response { id, .. } => Some(*id),
            Self::Notification { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_current_is_valid() {
        assert!(Handshake::current().is_valid());
    }

    #[test]
    fn handshake_wrong_magic_is_invalid() {
        let h = Handshake { magic: 0, version: HANDSHAKE_VERSION };
        assert!(!h.is_valid());
    }

    #[test]
    fn message_id_present_for_call_and_response_only() {
        let call = Message::call(1, "find_stream", vec![]);
        let resp = Message::ok_response(1, Value::Null);
        let notif = Message::notification("update_cfg", vec![]);
        assert_eq!(call.id(), Some(1));
        assert_eq!(resp.id(), Some(1));
        assert_eq!(notif.id(), None);
    }

    #[test]
    fn serde_json_roundtrip_for_call() {
        let msg = Message::call(42, "ping", vec![Value::from(7)]);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        match back {
            Message::Call { id, name, args } => {
                assert_eq!(id, 42);
                assert_eq!(name, "ping");
                assert_eq!(args, vec![Value::from(7)]);
            }
            _ => panic!("expected Call"),
        }
    }
}
