//! Error types for ramux.
//!
//! Every error that can cross the connection has a short string code
//! (`ENOENT`, `ERANGE`, ...). Codes survive the trip through an RPC error
//! response, so a caller on the far side can still branch on them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::capability::Capability;

/// Main error type for all ramux operations.
#[derive(Debug, Error)]
pub enum RamuxError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (stat records).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid frame, malformed payload, duplicate channel, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Operation attempted against a capability the resource does not have.
    #[error("Not {0}")]
    Capability(Capability),

    /// Fewer bytes available than requested.
    #[error("Could not satisfy length: {0}")]
    ShortRead(String),

    /// A write or truncate would grow the resource past its size limit.
    #[error("File too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Size the operation asked for, saturated at `u64::MAX`.
        size: u64,
        /// Largest size the resource accepts.
        limit: u64,
    },

    /// The backing resource does not exist.
    #[error("ENOENT: {0}")]
    NotFound(String),

    /// The channel (or the whole connection) has closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// The backing storage has been closed.
    #[error("Storage closed")]
    StorageClosed,

    /// No handler registered for the requested method.
    #[error("Handler not found for method: {0}")]
    HandlerNotFound(String),

    /// The peer declined or failed a load request.
    #[error("Failed to load file: {0}")]
    LoadFailed(String),

    /// A request received no response in time.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Error reported by the peer with a code this side has no variant for.
    #[error("{code}: {message}")]
    Remote {
        /// Error code as sent by the peer.
        code: String,
        /// Human readable message.
        message: String,
    },

    /// A failure observed by several waiters at once.
    #[error(transparent)]
    Shared(Arc<RamuxError>),
}

/// Result type alias using RamuxError.
pub type Result<T> = std::result::Result<T, RamuxError>;

impl RamuxError {
    /// Short code identifying the error class on the wire.
    pub fn code(&self) -> &str {
        match self {
            RamuxError::Io(_) => "EIO",
            RamuxError::Json(_)
            | RamuxError::MsgPackEncode(_)
            | RamuxError::MsgPackDecode(_)
            | RamuxError::Protocol(_) => "EPROTO",
            RamuxError::Config(_) => "EINVAL",
            RamuxError::Capability(_) => "ENOTSUP",
            RamuxError::ShortRead(_) => "ERANGE",
            RamuxError::TooLarge { .. } => "EFBIG",
            RamuxError::NotFound(_) => "ENOENT",
            RamuxError::ChannelClosed | RamuxError::StorageClosed => "ECLOSED",
            RamuxError::HandlerNotFound(_) => "ENOSYS",
            RamuxError::LoadFailed(_) => "ELOAD",
            RamuxError::Timeout(_) => "ETIMEDOUT",
            RamuxError::BackpressureTimeout => "EBUSY",
            RamuxError::Remote { code, .. } => code,
            RamuxError::Shared(inner) => inner.code(),
        }
    }

    /// Message sent alongside the code in an error response.
    pub fn message(&self) -> String {
        match self {
            RamuxError::ShortRead(msg) | RamuxError::NotFound(msg) => msg.clone(),
            RamuxError::Remote { message, .. } => message.clone(),
            RamuxError::Shared(inner) => inner.message(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error from a code/message pair received from the peer.
    pub fn from_remote(code: &str, message: String) -> Self {
        match code {
            "ENOENT" => RamuxError::NotFound(message),
            "ERANGE" => RamuxError::ShortRead(message),
            "ECLOSED" => RamuxError::ChannelClosed,
            _ => RamuxError::Remote {
                code: code.to_string(),
                message,
            },
        }
    }

    /// Follow `Shared` wrappers down to the original error.
    pub fn root(&self) -> &RamuxError {
        match self {
            RamuxError::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Check if this is a not-found error (including remote `ENOENT`).
    pub fn is_not_found(&self) -> bool {
        self.code() == "ENOENT"
    }

    /// Check if this is a closed-channel or closed-storage error.
    pub fn is_closed(&self) -> bool {
        self.code() == "ECLOSED"
    }

    /// Check if this is a short read.
    pub fn is_short_read(&self) -> bool {
        self.code() == "ERANGE"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(RamuxError::NotFound("a".into()).code(), "ENOENT");
        assert_eq!(RamuxError::ShortRead("a".into()).code(), "ERANGE");
        assert_eq!(RamuxError::ChannelClosed.code(), "ECLOSED");
        assert_eq!(RamuxError::Capability(Capability::Writable).code(), "ENOTSUP");
    }

    #[test]
    fn test_capability_display() {
        let err = RamuxError::Capability(Capability::Readable);
        assert_eq!(err.to_string(), "Not readable");
    }

    #[test]
    fn test_from_remote_restores_typed_variants() {
        assert!(matches!(
            RamuxError::from_remote("ENOENT", "missing.txt".into()),
            RamuxError::NotFound(m) if m == "missing.txt"
        ));
        assert!(matches!(
            RamuxError::from_remote("ECLOSED", String::new()),
            RamuxError::ChannelClosed
        ));
        let other = RamuxError::from_remote("EWHATEVER", "odd".into());
        assert_eq!(other.code(), "EWHATEVER");
        assert_eq!(other.to_string(), "EWHATEVER: odd");
    }

    #[test]
    fn test_shared_is_transparent() {
        let shared = RamuxError::Shared(Arc::new(RamuxError::NotFound("x".into())));
        assert!(shared.is_not_found());
        assert_eq!(shared.to_string(), "ENOENT: x");
        assert!(matches!(shared.root(), RamuxError::NotFound(_)));
    }
}
