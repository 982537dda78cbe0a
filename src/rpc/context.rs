//! Request context for handlers.
//!
//! ```ignore
//! builder.respond::<Utf8, _, _>("echo", |text, ctx| async move {
//!     ctx.respond::<Utf8>(&text).await
//! });
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::message::{RemoteError, RpcMessage};
use super::Rpc;
use crate::codec::{Codec, MsgPackCodec};
use crate::error::{RamuxError, Result};

/// Context passed to request handlers.
///
/// Clones share the "already responded" flag, so a request is answered at
/// most once however many copies exist.
#[derive(Clone)]
pub struct RequestContext {
    method: Arc<str>,
    request_id: u32,
    rpc: Rpc,
    responded: Arc<AtomicBool>,
}

impl RequestContext {
    pub(crate) fn new(method: &str, request_id: u32, rpc: Rpc) -> Self {
        Self {
            method: Arc::from(method),
            request_id,
            rpc,
            responded: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Check if this is an event (no response expected).
    #[inline]
    pub fn is_event(&self) -> bool {
        self.request_id == 0
    }

    /// The session this request arrived on.
    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    pub fn has_responded(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Send a response encoded with `C`.
    pub async fn respond<C: Codec>(&self, item: &C::Item) -> Result<()> {
        let payload = C::to_bytes(item)?;
        self.send(RpcMessage::response(self.request_id, payload)).await
    }

    /// Send an empty response.
    pub async fn respond_empty(&self) -> Result<()> {
        self.send(RpcMessage::response(self.request_id, Bytes::new()))
            .await
    }

    /// Send an error response carrying `err`'s code and message.
    pub async fn error(&self, err: &RamuxError) -> Result<()> {
        let payload = MsgPackCodec::<RemoteError>::to_bytes(&RemoteError::from(err))?;
        self.send(RpcMessage::error(self.request_id, payload)).await
    }

    async fn send(&self, msg: RpcMessage) -> Result<()> {
        if self.is_event() {
            return Ok(());
        }
        if self.responded.swap(true, Ordering::AcqRel) {
            return Err(RamuxError::Protocol(format!(
                "Request {} ({}) already answered",
                self.request_id, self.method
            )));
        }
        let sent = self.rpc.send(msg).await;
        if sent.is_err() {
            // Nothing reached the peer; leave room for an error response.
            self.responded.store(false, Ordering::Release);
        }
        sent
    }
}
