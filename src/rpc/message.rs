//! RPC message layout inside a mux `MESSAGE` payload.
//!
//! ```text
//! ┌───────┬────────────┬────────────┬────────┬───────────┐
//! │ Type  │ Request id │ Method len │ Method │ Payload … │
//! │ 1 byte│ uint32 BE  │ 1 byte     │ UTF-8  │           │
//! └───────┴────────────┴────────────┴────────┴───────────┘
//! ```
//!
//! Responses and errors leave the method empty. Request id 0 is reserved for
//! events.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::ensure_remaining;
use crate::error::{RamuxError, Result};

/// Message type constants.
pub mod message_type {
    /// Request expecting a response.
    pub const REQUEST: u8 = 1;
    /// Successful response.
    pub const RESPONSE: u8 = 2;
    /// Error response; payload is a MsgPack `RemoteError`.
    pub const ERROR: u8 = 3;
    /// Fire-and-forget notification.
    pub const EVENT: u8 = 4;
}

/// One decoded RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub kind: u8,
    pub request_id: u32,
    pub method: String,
    pub payload: Bytes,
}

impl RpcMessage {
    pub fn request(request_id: u32, method: &str, payload: Bytes) -> Self {
        Self {
            kind: message_type::REQUEST,
            request_id,
            method: method.to_string(),
            payload,
        }
    }

    pub fn event(method: &str, payload: Bytes) -> Self {
        Self {
            kind: message_type::EVENT,
            request_id: 0,
            method: method.to_string(),
            payload,
        }
    }

    pub fn response(request_id: u32, payload: Bytes) -> Self {
        Self {
            kind: message_type::RESPONSE,
            request_id,
            method: String::new(),
            payload,
        }
    }

    pub fn error(request_id: u32, payload: Bytes) -> Self {
        Self {
            kind: message_type::ERROR,
            request_id,
            method: String::new(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let method_len = u8::try_from(self.method.len()).map_err(|_| {
            RamuxError::Protocol(format!("Method name too long: {}", self.method))
        })?;
        let mut buf = BytesMut::with_capacity(6 + self.method.len() + self.payload.len());
        buf.put_u8(self.kind);
        buf.put_u32(self.request_id);
        buf.put_u8(method_len);
        buf.put_slice(self.method.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 6, "rpc header")?;
        let kind = buf.get_u8();
        let request_id = buf.get_u32();
        let method_len = buf.get_u8() as usize;
        ensure_remaining(&buf, method_len, "rpc method")?;
        let method = String::from_utf8(buf.split_to(method_len).to_vec())
            .map_err(|e| RamuxError::Protocol(format!("Invalid method name: {}", e)))?;
        Ok(Self {
            kind,
            request_id,
            method,
            payload: buf,
        })
    }
}

/// Error record carried by an `ERROR` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl From<&RamuxError> for RemoteError {
    fn from(err: &RamuxError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.message(),
        }
    }
}

impl From<RemoteError> for RamuxError {
    fn from(err: RemoteError) -> Self {
        RamuxError::from_remote(&err.code, err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let msg = RpcMessage::request(0x0102_0304, "read", Bytes::from_static(&[9, 9]));
        let bytes = msg.encode().unwrap();
        assert_eq!(
            &bytes[..],
            &[1, 1, 2, 3, 4, 4, b'r', b'e', b'a', b'd', 9, 9]
        );
        assert_eq!(RpcMessage::decode(bytes).unwrap(), msg);
    }

    #[test]
    fn test_event_has_request_id_zero() {
        let msg = RpcMessage::event("unlink", Bytes::new());
        let decoded = RpcMessage::decode(msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, message_type::EVENT);
        assert_eq!(decoded.request_id, 0);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_method_too_long() {
        let long = "m".repeat(256);
        assert!(RpcMessage::request(1, &long, Bytes::new()).encode().is_err());
    }

    #[test]
    fn test_truncated_message() {
        assert!(RpcMessage::decode(Bytes::from_static(&[1, 0, 0])).is_err());
        assert!(RpcMessage::decode(Bytes::from_static(&[1, 0, 0, 0, 1, 5, b'a'])).is_err());
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err = RamuxError::NotFound("a.txt".into());
        let remote = RemoteError::from(&err);
        assert_eq!(remote.code, "ENOENT");
        assert_eq!(remote.message, "a.txt");

        let back = RamuxError::from(remote);
        assert!(back.is_not_found());
    }
}
