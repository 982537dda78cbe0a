//! Codec module - serialization/deserialization for RPC payloads.
//!
//! Every RPC method is registered with a request codec and answered with a
//! response codec. A codec is a marker type implementing [`Codec`]; its
//! `Item` is the Rust value carried on the wire.
//!
//! - Primitive codecs: [`Empty`], [`Uint64`], [`Bool`], [`Utf8`], [`Binary`]
//! - Operation codecs: [`CapabilityCodec`], [`OffsetSizeCodec`],
//!   [`OffsetBufferCodec`], [`StatCodec`]
//! - [`MsgPackCodec`] - MessagePack for structured records (error responses)
//!
//! # Example
//!
//! ```
//! use ramux::codec::{Codec, OffsetSize, OffsetSizeCodec};
//!
//! let encoded = OffsetSizeCodec::to_bytes(&OffsetSize { offset: 4, size: 16 }).unwrap();
//! assert_eq!(encoded.len(), 16);
//! let decoded = OffsetSizeCodec::decode(encoded).unwrap();
//! assert_eq!(decoded, OffsetSize { offset: 4, size: 16 });
//! ```

mod messages;
mod msgpack;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RamuxError, Result};

pub use messages::{
    CapabilityCodec, OffsetBuffer, OffsetBufferCodec, OffsetSize, OffsetSizeCodec, StatCodec,
};
pub use msgpack::MsgPackCodec;

/// A binary encoding for one payload type.
pub trait Codec {
    /// The value carried by this codec.
    type Item: Send + 'static;

    /// Append the encoding of `item` to `buf`.
    fn encode(item: &Self::Item, buf: &mut BytesMut) -> Result<()>;

    /// Decode a complete payload.
    fn decode(buf: Bytes) -> Result<Self::Item>;

    /// Encode into a fresh buffer.
    fn to_bytes(item: &Self::Item) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        Self::encode(item, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Fail with a protocol error if `buf` has fewer than `needed` bytes left.
pub(crate) fn ensure_remaining(buf: &impl Buf, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(RamuxError::Protocol(format!(
            "Truncated {}: need {} bytes, have {}",
            what,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

/// No payload at all. Decoding ignores whatever is present.
pub struct Empty;

impl Codec for Empty {
    type Item = ();

    fn encode(_item: &(), _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn decode(_buf: Bytes) -> Result<()> {
        Ok(())
    }
}

/// Unsigned 64-bit integer, big endian.
pub struct Uint64;

impl Codec for Uint64 {
    type Item = u64;

    fn encode(item: &u64, buf: &mut BytesMut) -> Result<()> {
        buf.put_u64(*item);
        Ok(())
    }

    fn decode(mut buf: Bytes) -> Result<u64> {
        ensure_remaining(&buf, 8, "uint64")?;
        Ok(buf.get_u64())
    }
}

/// Single byte boolean. An empty payload decodes to `false`.
pub struct Bool;

impl Codec for Bool {
    type Item = bool;

    fn encode(item: &bool, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(u8::from(*item));
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<bool> {
        Ok(buf.first().is_some_and(|b| *b != 0))
    }
}

/// UTF-8 string filling the whole payload.
pub struct Utf8;

impl Codec for Utf8 {
    type Item = String;

    fn encode(item: &String, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(item.as_bytes());
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<String> {
        String::from_utf8(buf.to_vec())
            .map_err(|e| RamuxError::Protocol(format!("Invalid UTF-8 payload: {}", e)))
    }
}

/// Raw bytes filling the whole payload (zero-copy on decode).
pub struct Binary;

impl Codec for Binary {
    type Item = Bytes;

    fn encode(item: &Bytes, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(item);
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<Bytes> {
        Ok(buf)
    }
}
