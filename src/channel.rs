//! One storage resource bridged across a connection.
//!
//! The server side owns the resource and registers one RPC handler per
//! enabled capability (plus `open`, `unlink` and `close`). The client side
//! turns trait calls into requests. Both sides are [`ResourceChannel`]s and
//! both implement [`RandomAccess`], with the same capability checks.
//!
//! ```text
//! Created ──► Opening ──► Open ──► Closed
//!              (client waits for the handshake; server is open at once)
//! ```
//!
//! The server's handshake is the one-byte capability set; the client sends
//! `0`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::capability::{Capability, CapabilitySet};
use crate::codec::{
    Binary, CapabilityCodec, Codec, Empty, OffsetBuffer, OffsetBufferCodec, OffsetSize,
    OffsetSizeCodec, StatCodec, Uint64,
};
use crate::error::{RamuxError, Result};
use crate::loader::{Loader, LoaderInner};
use crate::mux::{ChannelKey, Mux};
use crate::rpc::{Rpc, RpcBuilder, DEFAULT_TIMEOUT};
use crate::storage::{RandomAccess, Stat};

/// Default protocol namespace for resource channels.
pub const DEFAULT_PROTOCOL: &str = "randomAccessChannel";

/// Settings for [`ResourceChannel::serve`] and [`ResourceChannel::connect`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel namespace.
    pub protocol: String,
    /// Channel identity within the namespace.
    pub id: Bytes,
    /// Per-request timeout, also bounds the wait for the handshake.
    pub timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            id: Bytes::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn id(mut self, id: impl Into<Bytes>) -> Self {
        self.id = id.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.protocol.clone(), self.id.clone())
    }
}

/// Which end of the channel this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the backing resource.
    Server,
    /// Forwards operations to the server.
    Client,
}

struct Metadata {
    loader: Weak<LoaderInner>,
    file_hash: Bytes,
}

struct ChannelInner {
    role: Role,
    rpc: Rpc,
    capabilities: OnceLock<CapabilitySet>,
    resource: Option<Arc<dyn RandomAccess>>,
    resource_closed: Arc<AtomicBool>,
    meta: OnceLock<Metadata>,
}

/// A served or connected resource. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResourceChannel {
    inner: Arc<ChannelInner>,
}

/// Closes `resource` once; later calls report success without touching it.
async fn close_once(resource: &dyn RandomAccess, flag: &AtomicBool) -> Result<()> {
    if flag.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    resource.close().await
}

impl ResourceChannel {
    /// Serve the resource built by `factory` on `mux`.
    ///
    /// The channel is keyed by `(config.protocol, config.id)` and is usable
    /// locally right away; the peer attaches with [`ResourceChannel::connect`].
    pub async fn serve<F>(mux: &Mux, factory: F, config: &ChannelConfig) -> Result<Self>
    where
        F: FnOnce() -> Result<Arc<dyn RandomAccess>>,
    {
        let resource = factory()?;
        let caps = resource.capabilities();
        let handshake = CapabilityCodec::to_bytes(&caps)?;
        let resource_closed = Arc::new(AtomicBool::new(false));

        let builder = server_handlers(
            RpcBuilder::new().timeout(config.timeout),
            caps,
            &resource,
            &resource_closed,
        );
        let (rpc, dispatcher) = builder.open(mux, config.key(), handshake).await?;
        dispatcher.spawn();

        // Release the resource however the channel ends.
        {
            let rpc = rpc.clone();
            let resource = resource.clone();
            let flag = resource_closed.clone();
            tokio::spawn(async move {
                rpc.closed().await;
                if let Err(e) = close_once(resource.as_ref(), &flag).await {
                    tracing::debug!(key = %rpc.key(), error = %e, "closing resource after channel close");
                }
            });
        }

        tracing::debug!(key = %rpc.key(), capabilities = ?caps, "serving resource");

        let capabilities = OnceLock::new();
        let _ = capabilities.set(caps);
        Ok(Self {
            inner: Arc::new(ChannelInner {
                role: Role::Server,
                rpc,
                capabilities,
                resource: Some(resource),
                resource_closed,
                meta: OnceLock::new(),
            }),
        })
    }

    /// Attach to the resource served under `config`'s key.
    ///
    /// Returns immediately; operations wait for the handshake.
    pub async fn connect(mux: &Mux, config: &ChannelConfig) -> Result<Self> {
        let handshake = CapabilityCodec::to_bytes(&CapabilitySet::EMPTY)?;
        let (rpc, dispatcher) = RpcBuilder::new()
            .timeout(config.timeout)
            .open(mux, config.key(), handshake)
            .await?;
        dispatcher.spawn();

        tracing::debug!(key = %rpc.key(), "connecting to resource");

        Ok(Self {
            inner: Arc::new(ChannelInner {
                role: Role::Client,
                rpc,
                capabilities: OnceLock::new(),
                resource: None,
                resource_closed: Arc::new(AtomicBool::new(false)),
                meta: OnceLock::new(),
            }),
        })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_server(&self) -> bool {
        self.inner.role == Role::Server
    }

    pub fn key(&self) -> &ChannelKey {
        self.inner.rpc.key()
    }

    /// Check if both handles refer to the same channel.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The underlying RPC session.
    pub fn rpc(&self) -> &Rpc {
        &self.inner.rpc
    }

    pub fn is_closed(&self) -> bool {
        self.inner.rpc.is_closed()
    }

    /// Wait for the handshake (client) and return the capability set.
    pub async fn opened(&self) -> Result<CapabilitySet> {
        if let Some(caps) = self.inner.capabilities.get() {
            return Ok(*caps);
        }

        let rpc = &self.inner.rpc;
        let handshake = tokio::time::timeout(rpc.timeout(), rpc.opened())
            .await
            .map_err(|_| RamuxError::Timeout(rpc.timeout()))??;
        let caps = CapabilityCodec::decode(handshake)?;
        let caps = *self.inner.capabilities.get_or_init(|| caps);
        tracing::trace!(key = %self.key(), capabilities = ?caps, "handshake complete");
        Ok(caps)
    }

    /// Wait until the channel is closed.
    pub async fn closed(&self) {
        self.inner.rpc.closed().await
    }

    /// The loader that produced this channel, if it is still alive.
    pub fn loader(&self) -> Option<Loader> {
        self.inner
            .meta
            .get()
            .and_then(|m| m.loader.upgrade())
            .map(Loader::from_inner)
    }

    /// Id derived from the file name by the loader's hasher.
    pub fn file_hash(&self) -> Option<&Bytes> {
        self.inner.meta.get().map(|m| &m.file_hash)
    }

    pub(crate) fn attach_metadata(&self, loader: Weak<LoaderInner>, file_hash: Bytes) {
        let _ = self.inner.meta.set(Metadata { loader, file_hash });
    }

    /// Closed check, then (client) handshake, then capability check.
    async fn prepare(&self, needed: Option<Capability>) -> Result<()> {
        if self.is_closed() {
            return Err(RamuxError::ChannelClosed);
        }
        let caps = self.opened().await?;
        match needed {
            Some(cap) if !caps.contains(cap) => Err(RamuxError::Capability(cap)),
            _ => Ok(()),
        }
    }

    fn resource(&self) -> Option<&dyn RandomAccess> {
        self.inner.resource.as_deref()
    }
}

fn server_handlers(
    builder: RpcBuilder,
    caps: CapabilitySet,
    resource: &Arc<dyn RandomAccess>,
    resource_closed: &Arc<AtomicBool>,
) -> RpcBuilder {
    let mut builder = builder;

    let res = resource.clone();
    builder = builder.respond::<Empty, _, _>("open", move |_, _ctx| {
        let res = res.clone();
        async move { res.open().await }
    });

    if caps.readable() {
        let res = resource.clone();
        builder = builder.respond::<OffsetSizeCodec, _, _>("read", move |req, ctx| {
            let res = res.clone();
            async move {
                let data = res.read(req.offset, req.size).await?;
                ctx.respond::<Binary>(&data).await
            }
        });
    }

    if caps.writable() {
        let res = resource.clone();
        builder = builder.respond::<OffsetBufferCodec, _, _>("write", move |req, _ctx| {
            let res = res.clone();
            async move { res.write(req.offset, req.buffer).await }
        });
    }

    if caps.deletable() {
        let res = resource.clone();
        builder = builder.respond::<OffsetSizeCodec, _, _>("del", move |req, _ctx| {
            let res = res.clone();
            async move { res.del(req.offset, req.size).await }
        });
    }

    if caps.truncatable() {
        let res = resource.clone();
        builder = builder.respond::<Uint64, _, _>("truncate", move |size, _ctx| {
            let res = res.clone();
            async move { res.truncate(size).await }
        });
    }

    if caps.statable() {
        let res = resource.clone();
        builder = builder.respond::<Empty, _, _>("stat", move |_, ctx| {
            let res = res.clone();
            async move {
                let stat = res.stat().await?;
                ctx.respond::<StatCodec>(&stat).await
            }
        });
    }

    let res = resource.clone();
    builder = builder.respond::<Empty, _, _>("unlink", move |_, _ctx| {
        let res = res.clone();
        async move { res.unlink().await }
    });

    let res = resource.clone();
    let flag = resource_closed.clone();
    builder.respond::<Empty, _, _>("close", move |_, ctx| {
        let res = res.clone();
        let flag = flag.clone();
        async move {
            let result = close_once(res.as_ref(), &flag).await;
            let sent = match &result {
                Ok(()) => ctx.respond_empty().await,
                Err(e) => ctx.error(e).await,
            };
            match &result {
                Ok(()) => ctx.rpc().end().await,
                Err(e) => ctx.rpc().destroy(e).await,
            }
            sent
        }
    })
}

#[async_trait]
impl RandomAccess for ResourceChannel {
    /// Empty on a client until the handshake has completed.
    fn capabilities(&self) -> CapabilitySet {
        self.inner.capabilities.get().copied().unwrap_or_default()
    }

    async fn open(&self) -> Result<()> {
        self.prepare(None).await?;
        match self.resource() {
            Some(res) => res.open().await,
            None => self.inner.rpc.request::<Empty, Empty>("open", &()).await,
        }
    }

    async fn read(&self, offset: u64, size: u64) -> Result<Bytes> {
        self.prepare(Some(Capability::Readable)).await?;
        let data = match self.resource() {
            Some(res) => return res.read(offset, size).await,
            None => {
                self.inner
                    .rpc
                    .request::<OffsetSizeCodec, Binary>("read", &OffsetSize { offset, size })
                    .await?
            }
        };
        if data.len() as u64 != size {
            return Err(RamuxError::ShortRead(format!(
                "expected {} bytes at {}, got {}",
                size,
                offset,
                data.len()
            )));
        }
        Ok(data)
    }

    async fn write(&self, offset: u64, data: Bytes) -> Result<()> {
        self.prepare(Some(Capability::Writable)).await?;
        match self.resource() {
            Some(res) => res.write(offset, data).await,
            None => {
                self.inner
                    .rpc
                    .request::<OffsetBufferCodec, Empty>(
                        "write",
                        &OffsetBuffer {
                            offset,
                            buffer: data,
                        },
                    )
                    .await
            }
        }
    }

    async fn del(&self, offset: u64, size: u64) -> Result<()> {
        self.prepare(Some(Capability::Deletable)).await?;
        match self.resource() {
            Some(res) => res.del(offset, size).await,
            None => {
                self.inner
                    .rpc
                    .request::<OffsetSizeCodec, Empty>("del", &OffsetSize { offset, size })
                    .await
            }
        }
    }

    async fn truncate(&self, size: u64) -> Result<()> {
        self.prepare(Some(Capability::Truncatable)).await?;
        match self.resource() {
            Some(res) => res.truncate(size).await,
            None => self.inner.rpc.request::<Uint64, Empty>("truncate", &size).await,
        }
    }

    async fn stat(&self) -> Result<Stat> {
        self.prepare(Some(Capability::Statable)).await?;
        match self.resource() {
            Some(res) => res.stat().await,
            None => self.inner.rpc.request::<Empty, StatCodec>("stat", &()).await,
        }
    }

    /// On a client this is a notification: nothing is awaited, and a closed
    /// channel makes it a no-op.
    async fn unlink(&self) -> Result<()> {
        match self.resource() {
            Some(res) => {
                if self.is_closed() {
                    return Err(RamuxError::ChannelClosed);
                }
                res.unlink().await
            }
            None => {
                if self.is_closed() {
                    return Ok(());
                }
                match self.inner.rpc.event::<Empty>("unlink", &()).await {
                    Err(RamuxError::ChannelClosed) | Ok(()) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Close the resource, then the session. Closing twice is a no-op.
    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let rpc = &self.inner.rpc;
        let result = match self.resource() {
            Some(res) => close_once(res, &self.inner.resource_closed).await,
            None => rpc.request::<Empty, Empty>("close", &()).await,
        };
        match &result {
            Ok(()) => rpc.end().await,
            Err(e) => rpc.destroy(e).await,
        }
        result
    }
}

impl fmt::Debug for ResourceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceChannel")
            .field("role", &self.inner.role)
            .field("key", self.key())
            .field("capabilities", &self.inner.capabilities.get())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxConfig;
    use crate::storage::MemoryStorage;
    use tokio::io::duplex;

    fn muxes() -> (Mux, Mux) {
        let (a, b) = duplex(256 * 1024);
        (Mux::new(a, MuxConfig::default()), Mux::new(b, MuxConfig::default()))
    }

    fn memory(storage: MemoryStorage) -> impl FnOnce() -> Result<Arc<dyn RandomAccess>> {
        move || Ok(Arc::new(storage) as Arc<dyn RandomAccess>)
    }

    #[tokio::test]
    async fn test_client_learns_capabilities_from_handshake() {
        let (left, right) = muxes();
        let caps = CapabilitySet::new(true, false, false, true, true);
        let config = ChannelConfig::default();

        let _server = ResourceChannel::serve(
            &left,
            memory(MemoryStorage::new().with_capabilities(caps)),
            &config,
        )
        .await
        .unwrap();
        let client = ResourceChannel::connect(&right, &config).await.unwrap();

        assert_eq!(client.capabilities(), CapabilitySet::EMPTY);
        assert_eq!(client.opened().await.unwrap(), caps);
        assert_eq!(client.capabilities(), caps);
        assert_eq!(client.role(), Role::Client);
    }

    #[tokio::test]
    async fn test_server_side_is_usable_without_peer() {
        let (left, _right) = muxes();
        let server = ResourceChannel::serve(&left, memory(MemoryStorage::new()), &ChannelConfig::default())
            .await
            .unwrap();

        server.write(0, Bytes::from_static(b"local")).await.unwrap();
        assert_eq!(&server.read(0, 5).await.unwrap()[..], b"local");
        assert!(server.is_server());
    }

    #[tokio::test]
    async fn test_capability_checked_before_anything_is_sent() {
        let (left, right) = muxes();
        let config = ChannelConfig::default().id("ro");
        let storage = MemoryStorage::from_bytes(b"fixed".to_vec())
            .with_capabilities(CapabilitySet::ALL.without(Capability::Writable));

        let server = ResourceChannel::serve(&left, memory(storage), &config).await.unwrap();
        let client = ResourceChannel::connect(&right, &config).await.unwrap();

        let err = client.write(0, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, RamuxError::Capability(Capability::Writable)));
        assert_eq!(err.to_string(), "Not writable");

        let err = server.write(0, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, RamuxError::Capability(Capability::Writable)));

        assert_eq!(&client.read(0, 5).await.unwrap()[..], b"fixed");
    }

    #[tokio::test]
    async fn test_open_reports_not_found() {
        let (left, right) = muxes();
        let folder = crate::storage::MemoryFolder::strict();
        let storage = folder.storage("missing.txt");
        let config = ChannelConfig::default();

        let _server = ResourceChannel::serve(&left, memory(storage), &config).await.unwrap();
        let client = ResourceChannel::connect(&right, &config).await.unwrap();

        let err = client.open().await.unwrap_err();
        assert_eq!(err.code(), "ENOENT");
    }

    #[tokio::test]
    async fn test_client_close_closes_both_sides() {
        let (left, right) = muxes();
        let config = ChannelConfig::default();
        let storage = Arc::new(MemoryStorage::new());
        let shared = storage.clone();

        let server = ResourceChannel::serve(
            &left,
            move || Ok(shared as Arc<dyn RandomAccess>),
            &config,
        )
        .await
        .unwrap();
        let client = ResourceChannel::connect(&right, &config).await.unwrap();
        client.open().await.unwrap();

        client.close().await.unwrap();
        assert!(client.is_closed());
        tokio::time::timeout(Duration::from_secs(1), server.closed())
            .await
            .unwrap();
        assert!(storage.is_closed());

        // Second close is a no-op.
        client.close().await.unwrap();
        assert!(matches!(
            client.stat().await,
            Err(RamuxError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_client_unlink_is_fire_and_forget() {
        let (left, right) = muxes();
        let folder = crate::storage::MemoryFolder::new();
        folder.create("u", b"data".to_vec());
        let storage = folder.storage("u");
        let config = ChannelConfig::default().id("u");

        let _server = ResourceChannel::serve(&left, memory(storage), &config).await.unwrap();
        let client = ResourceChannel::connect(&right, &config).await.unwrap();
        client.opened().await.unwrap();

        client.unlink().await.unwrap();
        // A request after the event is answered after the event was handled.
        assert_eq!(client.stat().await.unwrap().size, 0);
        assert!(!folder.contains("u"));

        client.close().await.unwrap();
        client.unlink().await.unwrap();
    }
}
