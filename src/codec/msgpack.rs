//! MsgPack codec using `rmp-serde`.
//!
//! Structs are always written with `to_vec_named` (struct-as-map), so a
//! peer in any language can read fields by name instead of by position.
//!
//! # Example
//!
//! ```
//! use ramux::codec::{Codec, MsgPackCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Record {
//!     code: String,
//!     message: String,
//! }
//!
//! let rec = Record { code: "ENOENT".into(), message: "a.txt".into() };
//! let encoded = MsgPackCodec::<Record>::to_bytes(&rec).unwrap();
//! let decoded = MsgPackCodec::<Record>::decode(encoded).unwrap();
//! assert_eq!(decoded, rec);
//! ```

use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Codec;
use crate::error::Result;

/// MessagePack codec for any serde type.
pub struct MsgPackCodec<T>(PhantomData<fn() -> T>);

impl<T> Codec for MsgPackCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn encode(item: &T, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(&rmp_serde::to_vec_named(item)?);
        Ok(())
    }

    #[inline]
    fn decode(buf: Bytes) -> Result<T> {
        Ok(rmp_serde::from_slice(&buf)?)
    }
}
