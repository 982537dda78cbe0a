//! Request/response/event sessions over one mux channel.
//!
//! An [`RpcBuilder`] collects typed handlers, then [`RpcBuilder::open`]
//! creates the mux channel and returns the [`Rpc`] handle used to issue
//! requests plus a [`Dispatcher`] that serves inbound traffic once spawned.
//! Spawning is left to the caller so state the handlers depend on can be set
//! up between the two.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ramux::Result<()> {
//! use bytes::Bytes;
//! use ramux::codec::Utf8;
//! use ramux::mux::{ChannelKey, Mux, MuxConfig};
//! use ramux::rpc::RpcBuilder;
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let server = Mux::new(a, MuxConfig::default());
//! let client = Mux::new(b, MuxConfig::default());
//! let key = ChannelKey::new("echo", "");
//!
//! let (_srv, dispatcher) = RpcBuilder::new()
//!     .respond::<Utf8, _, _>("shout", |text, ctx| async move {
//!         ctx.respond::<Utf8>(&text.to_uppercase()).await
//!     })
//!     .open(&server, key.clone(), Bytes::new())
//!     .await?;
//! dispatcher.spawn();
//!
//! let (rpc, dispatcher) = RpcBuilder::new().open(&client, key, Bytes::new()).await?;
//! dispatcher.spawn();
//!
//! let loud = rpc.request::<Utf8, Utf8>("shout", &"hi".to_string()).await?;
//! assert_eq!(loud, "HI");
//! # Ok(())
//! # }
//! ```

mod context;
mod message;
mod registry;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{Codec, MsgPackCodec};
use crate::error::{RamuxError, Result};
use crate::mux::{ChannelKey, Mux, MuxChannel};

pub use context::RequestContext;
pub use message::{message_type, RemoteError, RpcMessage};
pub use registry::{BoxFuture, Handler, HandlerRegistry, HandlerResult, TypedHandler};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

type Pending = HashMap<u32, oneshot::Sender<Result<Bytes>>>;

/// Collects handlers for a session before its channel exists.
pub struct RpcBuilder {
    registry: HandlerRegistry,
    timeout: Duration,
}

impl Default for RpcBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Per-request timeout for requests issued on the session.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a handler for `method`; requests and events both reach it.
    pub fn respond<C, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        C: Codec + 'static,
        F: Fn(C::Item, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry.register::<C, F, Fut>(method, handler);
        self
    }

    /// Create the channel for `key` and bind the session to it.
    pub async fn open(
        self,
        mux: &Mux,
        key: ChannelKey,
        handshake: Bytes,
    ) -> Result<(Rpc, Dispatcher)> {
        let (channel, inbound) = mux.create_channel(key, handshake).await?;
        let rpc = Rpc {
            inner: Arc::new(RpcInner {
                channel,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                timeout: self.timeout,
            }),
        };
        let dispatcher = Dispatcher {
            rpc: rpc.clone(),
            inbound,
            registry: self.registry,
        };
        Ok((rpc, dispatcher))
    }
}

struct RpcInner {
    channel: MuxChannel,
    pending: Mutex<Pending>,
    next_id: AtomicU32,
    timeout: Duration,
}

impl RpcInner {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to an RPC session. Cheap to clone.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

impl Rpc {
    pub fn channel(&self) -> &MuxChannel {
        &self.inner.channel
    }

    pub fn key(&self) -> &ChannelKey {
        self.inner.channel.key()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Wait for the peer to attach; returns its handshake bytes.
    pub async fn opened(&self) -> Result<Bytes> {
        self.inner.channel.opened().await
    }

    /// Wait until the session's channel has closed.
    pub async fn closed(&self) {
        self.inner.channel.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    /// Send a request and wait for its response.
    ///
    /// Fails with `Timeout` if no response arrives within the session
    /// timeout; the channel itself is left untouched.
    pub async fn request<Req: Codec, Res: Codec>(
        &self,
        method: &str,
        item: &Req::Item,
    ) -> Result<Res::Item> {
        if self.is_closed() {
            return Err(RamuxError::ChannelClosed);
        }
        let payload = Req::to_bytes(item)?;
        let id = self.next_request_id();

        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id, tx);

        let exchange = async {
            self.send(RpcMessage::request(id, method, payload)).await?;
            rx.await.map_err(|_| RamuxError::ChannelClosed)?
        };

        let response = match tokio::time::timeout(self.inner.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(key = %self.key(), method, id, "request timed out");
                Err(RamuxError::Timeout(self.inner.timeout))
            }
        };
        if response.is_err() {
            self.inner.pending().remove(&id);
        }
        Res::decode(response?)
    }

    /// Send a fire-and-forget event.
    pub async fn event<C: Codec>(&self, method: &str, item: &C::Item) -> Result<()> {
        if self.is_closed() {
            return Err(RamuxError::ChannelClosed);
        }
        let payload = C::to_bytes(item)?;
        self.send(RpcMessage::event(method, payload)).await
    }

    /// Close the session gracefully. Pending requests fail with `ChannelClosed`.
    pub async fn end(&self) {
        self.inner.channel.close().await;
        self.fail_pending();
    }

    /// Close the session because of `err`.
    pub async fn destroy(&self, err: &RamuxError) {
        tracing::warn!(key = %self.key(), error = %err, "destroying rpc session");
        self.end().await;
    }

    pub(crate) async fn send(&self, msg: RpcMessage) -> Result<()> {
        self.inner.channel.send(msg.encode()?).await
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn complete(&self, request_id: u32, result: Result<Bytes>) {
        match self.inner.pending().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::trace!(key = %self.key(), request_id, "late or unknown response"),
        }
    }

    fn fail_pending(&self) {
        // Dropping the senders fails every waiter with ChannelClosed.
        self.inner.pending().clear();
    }
}

impl fmt::Debug for Rpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rpc")
            .field("key", self.key())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Serves inbound messages for one session.
///
/// Handlers run one at a time, in arrival order.
pub struct Dispatcher {
    rpc: Rpc,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    registry: HandlerRegistry,
}

impl Dispatcher {
    /// Run the dispatch loop on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(raw) = self.inbound.recv().await {
            let msg = match RpcMessage::decode(raw) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(key = %self.rpc.key(), error = %e, "dropping malformed rpc message");
                    continue;
                }
            };

            match msg.kind {
                message_type::RESPONSE => self.rpc.complete(msg.request_id, Ok(msg.payload)),
                message_type::ERROR => {
                    let err = match MsgPackCodec::<RemoteError>::decode(msg.payload) {
                        Ok(remote) => RamuxError::from(remote),
                        Err(e) => e,
                    };
                    self.rpc.complete(msg.request_id, Err(err));
                }
                message_type::REQUEST | message_type::EVENT => self.dispatch(msg).await,
                other => tracing::warn!(key = %self.rpc.key(), kind = other, "unknown rpc message type"),
            }
        }

        self.rpc.fail_pending();
        tracing::trace!(key = %self.rpc.key(), "dispatcher finished");
    }

    async fn dispatch(&self, msg: RpcMessage) {
        let ctx = RequestContext::new(&msg.method, msg.request_id, self.rpc.clone());

        let Some(handler) = self.registry.get(&msg.method) else {
            if ctx.is_event() {
                tracing::warn!(key = %self.rpc.key(), method = %msg.method, "no handler for event");
            } else {
                let err = RamuxError::HandlerNotFound(msg.method.clone());
                if let Err(e) = ctx.error(&err).await {
                    tracing::trace!(error = %e, "error response not sent");
                }
            }
            return;
        };

        // A panicking handler fails its own request; the session keeps serving.
        let result = AssertUnwindSafe(handler.call(msg.payload, ctx.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(RamuxError::Protocol(format!(
                    "Handler for {} panicked",
                    msg.method
                )))
            });

        if ctx.is_event() || ctx.has_responded() {
            if let Err(e) = result {
                tracing::warn!(key = %self.rpc.key(), method = %msg.method, error = %e, "handler failed after responding");
            }
            return;
        }

        let sent = match result {
            Ok(()) => ctx.respond_empty().await,
            Err(e) => {
                tracing::debug!(key = %self.rpc.key(), method = %msg.method, error = %e, "handler failed");
                ctx.error(&e).await
            }
        };
        if let Err(e) = sent {
            tracing::trace!(error = %e, "response not sent");
        }
    }
}
