//! One logical channel on a [`Mux`].

use std::fmt;

use bytes::Bytes;
use tokio::sync::watch;

use super::{ChannelKey, Mux};
use crate::error::{RamuxError, Result};

/// Lifecycle of a mux channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// `OPEN` sent, waiting for the peer's `OPEN` for the same key.
    Opening,
    /// Both sides attached. Carries the peer's handshake bytes.
    Open(Bytes),
    /// Closed locally, by the peer, or by connection loss. Terminal.
    Closed,
}

/// Sending half of a channel plus its lifecycle signals.
///
/// Inbound messages are delivered through the receiver returned by
/// [`Mux::create_channel`]; it yields `None` once the channel closes.
#[derive(Clone)]
pub struct MuxChannel {
    pub(super) id: u32,
    pub(super) key: ChannelKey,
    pub(super) mux: Mux,
    pub(super) state: watch::Receiver<ChannelState>,
}

impl MuxChannel {
    /// The channel's key.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Local channel number (what this side puts in its frame headers).
    pub fn local_id(&self) -> u32 {
        self.id
    }

    /// Current state snapshot.
    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.borrow(), ChannelState::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ChannelState::Closed)
    }

    /// Wait for the peer to attach; returns its handshake.
    ///
    /// Fails with `ChannelClosed` if the channel closes first.
    pub async fn opened(&self) -> Result<Bytes> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| !matches!(s, ChannelState::Opening))
            .await
            .map_err(|_| RamuxError::ChannelClosed)?;
        match &*state {
            ChannelState::Open(handshake) => Ok(handshake.clone()),
            _ => Err(RamuxError::ChannelClosed),
        }
    }

    /// Wait until the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| matches!(s, ChannelState::Closed)).await;
    }

    /// Send one message, waiting for the channel to open first.
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.opened().await?;
        if self.is_closed() {
            return Err(RamuxError::ChannelClosed);
        }
        self.mux.send_message(self.id, payload).await
    }

    /// Close the channel. The peer's channel for the same key closes too.
    ///
    /// Closing an already closed channel does nothing.
    pub async fn close(&self) {
        self.mux.close_local(self.id).await;
    }
}

impl fmt::Debug for MuxChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxChannel")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &*self.state.borrow())
            .finish()
    }
}
