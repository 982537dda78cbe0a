//! Protocol module - multiplexer wire format, framing, and frame types.
//!
//! - 6 to 9 byte header encoding/decoding (width chosen per connection)
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - `OPEN` payload carrying the channel key and handshake

mod frame;
mod frame_buffer;
mod open;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use open::OpenPayload;
pub use wire_format::{
    kind, Header, LengthWidth, DEFAULT_MAX_PAYLOAD_SIZE, FIXED_HEADER_SIZE, MAX_HEADER_SIZE,
};
