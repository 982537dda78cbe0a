//! Payload layouts for the resource operations.
//!
//! ```text
//! capability      u8 bitmask (absent byte = empty set)
//! offset + size   u64 BE offset | u64 BE size
//! offset + bytes  u64 BE offset | u32 BE length | bytes
//! stat            JSON object, at least {"size": n}
//! ```
//!
//! The offset/size and offset/bytes decoders accept a zero-length payload and
//! return the default (all-zero, empty) structure.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{ensure_remaining, Codec};
use crate::capability::CapabilitySet;
use crate::error::{RamuxError, Result};
use crate::storage::Stat;

/// Handshake codec for the capability set.
pub struct CapabilityCodec;

impl Codec for CapabilityCodec {
    type Item = CapabilitySet;

    fn encode(item: &CapabilitySet, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(item.bits());
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<CapabilitySet> {
        Ok(CapabilitySet::from_bits(buf.first().copied().unwrap_or(0)))
    }
}

/// Request payload for `read` and `del`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetSize {
    /// Start of the byte range.
    pub offset: u64,
    /// Length of the byte range.
    pub size: u64,
}

/// Codec for [`OffsetSize`].
pub struct OffsetSizeCodec;

impl Codec for OffsetSizeCodec {
    type Item = OffsetSize;

    fn encode(item: &OffsetSize, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(16);
        buf.put_u64(item.offset);
        buf.put_u64(item.size);
        Ok(())
    }

    fn decode(mut buf: Bytes) -> Result<OffsetSize> {
        if buf.is_empty() {
            return Ok(OffsetSize::default());
        }
        ensure_remaining(&buf, 16, "offset/size")?;
        Ok(OffsetSize {
            offset: buf.get_u64(),
            size: buf.get_u64(),
        })
    }
}

/// Request payload for `write`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetBuffer {
    /// Where to write.
    pub offset: u64,
    /// What to write.
    pub buffer: Bytes,
}

/// Codec for [`OffsetBuffer`].
pub struct OffsetBufferCodec;

impl Codec for OffsetBufferCodec {
    type Item = OffsetBuffer;

    fn encode(item: &OffsetBuffer, buf: &mut BytesMut) -> Result<()> {
        let len = u32::try_from(item.buffer.len()).map_err(|_| {
            RamuxError::Protocol(format!(
                "Write buffer of {} bytes exceeds u32 length prefix",
                item.buffer.len()
            ))
        })?;
        buf.reserve(12 + item.buffer.len());
        buf.put_u64(item.offset);
        buf.put_u32(len);
        buf.put_slice(&item.buffer);
        Ok(())
    }

    fn decode(mut buf: Bytes) -> Result<OffsetBuffer> {
        if buf.is_empty() {
            return Ok(OffsetBuffer::default());
        }
        ensure_remaining(&buf, 12, "offset/buffer")?;
        let offset = buf.get_u64();
        let len = buf.get_u32() as usize;
        ensure_remaining(&buf, len, "offset/buffer body")?;
        Ok(OffsetBuffer {
            offset,
            buffer: buf.split_to(len),
        })
    }
}

/// JSON codec for [`Stat`]. Not on the hot path.
pub struct StatCodec;

impl Codec for StatCodec {
    type Item = Stat;

    fn encode(item: &Stat, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(&serde_json::to_vec(item)?);
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<Stat> {
        Ok(serde_json::from_slice(&buf)?)
    }
}
