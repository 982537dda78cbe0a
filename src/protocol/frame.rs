//! Frame struct with typed accessors.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use ramux::protocol::{kind, Frame, Header};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(Header::new(kind::MESSAGE, 3, 5), Bytes::from_static(b"hello"));
//!
//! assert!(frame.is_message());
//! assert_eq!(frame.channel(), 3);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{Header, LengthWidth};

/// A complete multiplexer frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Sender's local channel number.
    #[inline]
    pub fn channel(&self) -> u32 {
        self.header.channel
    }

    #[inline]
    pub fn kind(&self) -> u8 {
        self.header.kind
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.header.is_open()
    }

    #[inline]
    pub fn is_close(&self) -> bool {
        self.header.is_close()
    }

    #[inline]
    pub fn is_message(&self) -> bool {
        self.header.is_message()
    }
}

/// Build a complete frame as a single contiguous buffer.
///
/// The writer task does not use this (it writes header and payload with
/// `write_vectored`); it is handy for tests and for pre-building frames.
pub fn build_frame(header: &Header, payload: &[u8], width: LengthWidth) -> Vec<u8> {
    let (head, len) = header.encode(width);
    let mut buf = Vec::with_capacity(len + payload.len());
    buf.extend_from_slice(&head[..len]);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{kind, FrameBuffer};

    #[test]
    fn test_frame_accessors() {
        let frame = Frame::new(
            Header::new(kind::OPEN, 42, 4),
            Bytes::from_static(b"test"),
        );
        assert_eq!(frame.channel(), 42);
        assert_eq!(frame.kind(), kind::OPEN);
        assert!(frame.is_open());
        assert!(!frame.is_message());
        assert_eq!(frame.payload(), b"test");
    }

    #[test]
    fn test_build_frame_roundtrip() {
        let header = Header::new(kind::MESSAGE, 456, 10);
        let bytes = build_frame(&header, b"0123456789", LengthWidth::Bits24);
        assert_eq!(bytes.len(), LengthWidth::Bits24.header_size() + 10);

        let mut buffer = FrameBuffer::new(LengthWidth::Bits24);
        let frames = buffer.push(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel(), 456);
        assert_eq!(frames[0].payload(), b"0123456789");
    }
}
