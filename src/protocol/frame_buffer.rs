//! Reassembles frames from arbitrary read chunks.
//!
//! The buffer alternates between two phases: reading a header of the
//! configured width, then collecting that header's payload. Payloads are
//! split off the `BytesMut` without copying.

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, LengthWidth, DEFAULT_MAX_PAYLOAD_SIZE};
use super::Frame;
use crate::error::Result;

const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy)]
enum Phase {
    Head,
    Body(Header),
}

/// Accumulates inbound bytes and yields complete frames.
pub struct FrameBuffer {
    pending: BytesMut,
    phase: Phase,
    width: LengthWidth,
    max_payload_size: u32,
}

impl FrameBuffer {
    pub fn new(width: LengthWidth) -> Self {
        Self::with_max_payload(width, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Reject frames whose declared payload exceeds `max_payload_size`.
    pub fn with_max_payload(width: LengthWidth, max_payload_size: u32) -> Self {
        Self {
            pending: BytesMut::with_capacity(INITIAL_CAPACITY),
            phase: Phase::Head,
            width,
            max_payload_size,
        }
    }

    /// Append `data` and return every frame it completes.
    ///
    /// A trailing partial frame stays buffered. An invalid header (unknown
    /// kind, oversized payload) is an error; the stream is unusable after it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.pending.extend_from_slice(data);

        let mut out = Vec::new();
        while let Some(frame) = self.next_frame()? {
            out.push(frame);
        }
        Ok(out)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Phase::Head = self.phase {
            let Some(header) = Header::decode(&self.pending, self.width) else {
                return Ok(None);
            };
            header.validate(self.width, self.max_payload_size)?;
            let _ = self.pending.split_to(self.width.header_size());
            self.phase = Phase::Body(header);
        }

        let Phase::Body(header) = self.phase else {
            return Ok(None);
        };
        let wanted = header.payload_length as usize;
        if self.pending.len() < wanted {
            return Ok(None);
        }

        let payload = if wanted == 0 {
            Bytes::new()
        } else {
            self.pending.split_to(wanted).freeze()
        };
        self.phase = Phase::Head;
        Ok(Some(Frame::new(header, payload)))
    }

    /// Buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    fn mid_frame(&self) -> bool {
        matches!(self.phase, Phase::Body(_))
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(LengthWidth::default())
    }
}
