//! Payload of an `OPEN` frame.
//!
//! ```text
//! │ u16 protocol len │ protocol UTF-8 │ u16 id len │ id │ handshake … │
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ensure_remaining;
use crate::error::{RamuxError, Result};

/// Channel identity plus handshake, as announced by the opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPayload {
    pub protocol: String,
    pub id: Bytes,
    pub handshake: Bytes,
}

impl OpenPayload {
    pub fn encode(&self) -> Result<Bytes> {
        let protocol_len = u16::try_from(self.protocol.len())
            .map_err(|_| RamuxError::Protocol("Protocol name too long".to_string()))?;
        let id_len = u16::try_from(self.id.len())
            .map_err(|_| RamuxError::Protocol("Channel id too long".to_string()))?;

        let mut buf = BytesMut::with_capacity(4 + self.protocol.len() + self.id.len() + self.handshake.len());
        buf.put_u16(protocol_len);
        buf.put_slice(self.protocol.as_bytes());
        buf.put_u16(id_len);
        buf.put_slice(&self.id);
        buf.put_slice(&self.handshake);
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        ensure_remaining(&buf, 2, "open protocol length")?;
        let protocol_len = buf.get_u16() as usize;
        ensure_remaining(&buf, protocol_len, "open protocol")?;
        let protocol = String::from_utf8(buf.split_to(protocol_len).to_vec())
            .map_err(|e| RamuxError::Protocol(format!("Invalid protocol name: {}", e)))?;

        ensure_remaining(&buf, 2, "open id length")?;
        let id_len = buf.get_u16() as usize;
        ensure_remaining(&buf, id_len, "open id")?;
        let id = buf.split_to(id_len);

        Ok(Self {
            protocol,
            id,
            handshake: buf,
        })
    }
}
