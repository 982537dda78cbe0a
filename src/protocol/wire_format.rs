//! Wire format encoding and decoding.
//!
//! Implements the multiplexer frame header:
//! ```text
//! ┌───────┬───────────┬──────────────────────┐
//! │ Kind  │ Channel   │ Payload length       │
//! │ 1 byte│ 4 bytes   │ 2, 3 or 4 bytes      │
//! │       │ uint32 BE │ uint BE              │
//! └───────┴───────────┴──────────────────────┘
//! ```
//!
//! The width of the length prefix is fixed per connection ([`LengthWidth`]).
//! `Channel` is always the sender's local channel number.
//! All multi-byte integers are Big Endian.

use crate::error::{RamuxError, Result};

/// Bytes before the length prefix (kind + channel).
pub const FIXED_HEADER_SIZE: usize = 5;

/// Largest possible header (32-bit length prefix).
pub const MAX_HEADER_SIZE: usize = FIXED_HEADER_SIZE + 4;

/// Default maximum payload size (64 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Frame kinds.
pub mod kind {
    /// Channel open. Payload is an `OpenPayload`.
    pub const OPEN: u8 = 1;
    /// Channel close. Empty payload.
    pub const CLOSE: u8 = 2;
    /// Data on an open channel.
    pub const MESSAGE: u8 = 3;

    /// Check if `kind` is one of the defined kinds.
    #[inline]
    pub fn is_known(kind: u8) -> bool {
        matches!(kind, OPEN | CLOSE | MESSAGE)
    }
}

/// Width of the payload length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthWidth {
    /// 2 byte prefix, payloads up to 64 KB.
    Bits16,
    /// 3 byte prefix, payloads up to 16 MB.
    Bits24,
    /// 4 byte prefix.
    #[default]
    Bits32,
}

impl LengthWidth {
    /// Map a bit count (16, 24 or 32) to a width.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            16 => Ok(LengthWidth::Bits16),
            24 => Ok(LengthWidth::Bits24),
            32 => Ok(LengthWidth::Bits32),
            other => Err(RamuxError::Config(format!(
                "Unsupported length prefix width: {} bits (expected 16, 24 or 32)",
                other
            ))),
        }
    }

    /// Size of the prefix in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            LengthWidth::Bits16 => 2,
            LengthWidth::Bits24 => 3,
            LengthWidth::Bits32 => 4,
        }
    }

    /// Largest length the prefix can carry.
    #[inline]
    pub const fn max_payload(self) -> u32 {
        match self {
            LengthWidth::Bits16 => 0xFFFF,
            LengthWidth::Bits24 => 0xFF_FFFF,
            LengthWidth::Bits32 => u32::MAX,
        }
    }

    /// Full header size with this prefix.
    #[inline]
    pub const fn header_size(self) -> usize {
        FIXED_HEADER_SIZE + self.bytes()
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame kind (see [`kind`]).
    pub kind: u8,
    /// Sender's local channel number.
    pub channel: u32,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(kind: u8, channel: u32, payload_length: u32) -> Self {
        Self {
            kind,
            channel,
            payload_length,
        }
    }

    /// Encode into a fixed buffer, returning the used length.
    ///
    /// # Example
    ///
    /// ```
    /// use ramux::protocol::{kind, Header, LengthWidth};
    ///
    /// let (bytes, len) = Header::new(kind::MESSAGE, 7, 100).encode(LengthWidth::Bits16);
    /// assert_eq!(len, 7);
    /// assert_eq!(&bytes[..len], &[3, 0, 0, 0, 7, 0, 100]);
    /// ```
    pub fn encode(&self, width: LengthWidth) -> ([u8; MAX_HEADER_SIZE], usize) {
        let mut buf = [0u8; MAX_HEADER_SIZE];
        let len = self.encode_into(&mut buf, width);
        (buf, len)
    }

    /// Encode into an existing buffer, returning the used length.
    ///
    /// The length is truncated to the prefix width; call [`Header::validate`]
    /// first when the length is not known to fit.
    pub fn encode_into(&self, buf: &mut [u8], width: LengthWidth) -> usize {
        let size = width.header_size();
        debug_assert!(buf.len() >= size);
        buf[0] = self.kind;
        buf[1..5].copy_from_slice(&self.channel.to_be_bytes());
        let len = self.payload_length.to_be_bytes();
        buf[5..size].copy_from_slice(&len[4 - width.bytes()..]);
        size
    }

    /// Decode a header. Returns `None` if `buf` is too short.
    pub fn decode(buf: &[u8], width: LengthWidth) -> Option<Self> {
        let size = width.header_size();
        if buf.len() < size {
            return None;
        }
        let mut len = [0u8; 4];
        len[4 - width.bytes()..].copy_from_slice(&buf[5..size]);
        Some(Self {
            kind: buf[0],
            channel: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
            payload_length: u32::from_be_bytes(len),
        })
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Kind is defined
    /// - Payload length fits the prefix and doesn't exceed max
    pub fn validate(&self, width: LengthWidth, max_payload_size: u32) -> Result<()> {
        if !kind::is_known(self.kind) {
            return Err(RamuxError::Protocol(format!(
                "Unknown frame kind {}",
                self.kind
            )));
        }

        let limit = max_payload_size.min(width.max_payload());
        if self.payload_length > limit {
            return Err(RamuxError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, limit
            )));
        }

        Ok(())
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.kind == kind::OPEN
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        self.kind == kind::CLOSE
    }

    #[inline]
    pub fn is_message(&self) -> bool {
        self.kind == kind::MESSAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(kind::MESSAGE, 0x01020304, 0x05060708);
        let (bytes, len) = header.encode(LengthWidth::Bits32);
        assert_eq!(len, 9);
        assert_eq!(&bytes[..len], &[3, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_header_widths() {
        let header = Header::new(kind::OPEN, 1, 0x0A0B);
        for (width, expected) in [
            (LengthWidth::Bits16, vec![1, 0, 0, 0, 1, 0x0A, 0x0B]),
            (LengthWidth::Bits24, vec![1, 0, 0, 0, 1, 0, 0x0A, 0x0B]),
            (LengthWidth::Bits32, vec![1, 0, 0, 0, 1, 0, 0, 0x0A, 0x0B]),
        ] {
            let (bytes, len) = header.encode(width);
            assert_eq!(&bytes[..len], &expected[..]);
            assert_eq!(Header::decode(&bytes[..len], width), Some(header));
        }
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 6];
        assert!(Header::decode(&buf, LengthWidth::Bits16).is_none());
        assert!(Header::decode(&buf[..5], LengthWidth::Bits16).is_none());
    }

    #[test]
    fn test_from_bits() {
        assert_eq!(LengthWidth::from_bits(16).unwrap(), LengthWidth::Bits16);
        assert_eq!(LengthWidth::from_bits(24).unwrap(), LengthWidth::Bits24);
        assert_eq!(LengthWidth::from_bits(32).unwrap(), LengthWidth::Bits32);
        assert!(matches!(
            LengthWidth::from_bits(8),
            Err(RamuxError::Config(_))
        ));
    }

    #[test]
    fn test_validate_unknown_kind() {
        let header = Header::new(9, 1, 0);
        let err = header
            .validate(LengthWidth::Bits32, DEFAULT_MAX_PAYLOAD_SIZE)
            .unwrap_err();
        assert!(err.to_string().contains("Unknown frame kind"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(kind::MESSAGE, 1, 70_000);
        assert!(header.validate(LengthWidth::Bits16, u32::MAX).is_err());
        assert!(header.validate(LengthWidth::Bits24, u32::MAX).is_ok());
        assert!(header.validate(LengthWidth::Bits24, 1000).is_err());
    }

    #[test]
    fn test_kind_accessors() {
        assert!(Header::new(kind::OPEN, 0, 0).is_open());
        assert!(Header::new(kind::CLOSE, 0, 0).is_close());
        assert!(Header::new(kind::MESSAGE, 0, 0).is_message());
    }
}
