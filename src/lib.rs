//! # ramux
//!
//! Random-access storage over a multiplexed byte stream.
//!
//! A server exposes a byte-addressable resource (anything implementing
//! [`RandomAccess`]) on one logical channel of a connection; the client gets
//! a [`ResourceChannel`] that implements the same trait. A [`Loader`] serves
//! many such files by name over one connection.
//!
//! ## Architecture
//!
//! - **Mux** ([`mux`]): length-prefixed frames carrying many keyed channels
//! - **RPC** ([`rpc`]): request/response/event sessions, one per channel
//! - **Channel** ([`channel`]): one resource; capabilities in the handshake
//! - **Loader** ([`loader`]): name → channel, deduplicated loads
//! - **Proxy** ([`proxy`]): handles usable before their load completes
//!
//! ## Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ramux::Result<()> {
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use ramux::{ChannelConfig, Mux, MuxConfig, RandomAccess, ResourceChannel};
//! use ramux::storage::MemoryStorage;
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let server_mux = Mux::new(a, MuxConfig::default());
//! let client_mux = Mux::new(b, MuxConfig::default());
//! let config = ChannelConfig::default();
//!
//! let _server = ResourceChannel::serve(
//!     &server_mux,
//!     || Ok(Arc::new(MemoryStorage::new()) as Arc<dyn RandomAccess>),
//!     &config,
//! )
//! .await?;
//! let client = ResourceChannel::connect(&client_mux, &config).await?;
//!
//! client.write(0, Bytes::from_static(b"hello")).await?;
//! assert_eq!(&client.read(0, 5).await?[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod channel;
pub mod codec;
pub mod error;
pub mod loader;
pub mod mux;
pub mod protocol;
pub mod proxy;
pub mod rpc;
pub mod storage;

mod completion;
mod writer;

pub use capability::{Capability, CapabilitySet};
pub use channel::{ChannelConfig, ResourceChannel, Role};
pub use completion::Completion;
pub use error::{RamuxError, Result};
pub use loader::{Loader, LoaderConfig};
pub use mux::{ChannelKey, Mux, MuxConfig};
pub use proxy::{DeferredFile, FileFactory};
pub use storage::{RandomAccess, Stat};
pub use writer::WriterConfig;
