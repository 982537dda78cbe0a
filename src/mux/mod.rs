//! Stream multiplexer.
//!
//! Turns one duplex byte stream into many independent channels, each
//! identified by a [`ChannelKey`]. Either side may open a key first:
//!
//! 1. `create_channel` sends `OPEN` and leaves the channel `Opening`.
//! 2. When the peer's `OPEN` for the same key arrives (or had already
//!    arrived), the channel becomes `Open` with the peer's handshake.
//! 3. `pair` lets a side wait for the peer's `OPEN` before creating its own
//!    channel.
//!
//! Frames carry the sender's local channel number, so each side keeps a
//! remote-to-local map filled in when the two `OPEN`s meet.
//!
//! # Example
//!
//! ```
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ramux::Result<()> {
//! use bytes::Bytes;
//! use ramux::mux::{ChannelKey, Mux, MuxConfig};
//!
//! let (a, b) = tokio::io::duplex(64 * 1024);
//! let left = Mux::new(a, MuxConfig::default());
//! let right = Mux::new(b, MuxConfig::default());
//!
//! let key = ChannelKey::new("echo", "1");
//! let (tx, _) = left.create_channel(key.clone(), Bytes::from_static(b"L")).await?;
//! let (_, mut rx) = right.create_channel(key, Bytes::from_static(b"R")).await?;
//!
//! assert_eq!(&tx.opened().await?[..], b"R");
//! tx.send(Bytes::from_static(b"ping")).await?;
//! assert_eq!(&rx.recv().await.unwrap()[..], b"ping");
//! # Ok(())
//! # }
//! ```

mod channel;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{RamuxError, Result};
use crate::protocol::{kind, Frame, FrameBuffer, Header, LengthWidth, OpenPayload, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

pub use channel::{ChannelState, MuxChannel};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Identity of a channel: protocol namespace plus id bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub protocol: String,
    pub id: Bytes,
}

impl ChannelKey {
    pub fn new(protocol: impl Into<String>, id: impl Into<Bytes>) -> Self {
        Self {
            protocol: protocol.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}###{}", self.protocol, String::from_utf8_lossy(&self.id))
    }
}

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Width of the frame length prefix. Both sides must agree.
    pub length_width: LengthWidth,
    /// Largest payload sent or accepted on the connection.
    pub max_payload_size: u32,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            length_width: LengthWidth::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

impl MuxConfig {
    /// Default config with a 16, 24 or 32 bit length prefix.
    pub fn with_bits(bits: u32) -> Result<Self> {
        Ok(Self {
            length_width: LengthWidth::from_bits(bits)?,
            ..Self::default()
        })
    }

    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.max_payload_size = size;
        self
    }

    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }
}

struct Slot {
    key: ChannelKey,
    remote: Option<u32>,
    inbound: mpsc::UnboundedSender<Bytes>,
    state: watch::Sender<ChannelState>,
}

impl Slot {
    fn mark_closed(&self) {
        self.state.send_replace(ChannelState::Closed);
    }
}

struct RemoteOpen {
    remote: u32,
    handshake: Bytes,
}

#[derive(Default)]
struct MuxState {
    next_local: u32,
    channels: HashMap<u32, Slot>,
    by_key: HashMap<ChannelKey, u32>,
    by_remote: HashMap<u32, u32>,
    pending_remote: HashMap<ChannelKey, RemoteOpen>,
    pair_waiters: HashMap<ChannelKey, Vec<oneshot::Sender<()>>>,
    destroyed: bool,
}

impl MuxState {
    fn remove_local(&mut self, id: u32) -> Option<Slot> {
        let slot = self.channels.remove(&id)?;
        if let Some(remote) = slot.remote {
            self.by_remote.remove(&remote);
        }
        if self.by_key.get(&slot.key) == Some(&id) {
            self.by_key.remove(&slot.key);
        }
        slot.mark_closed();
        Some(slot)
    }
}

struct MuxInner {
    writer: WriterHandle,
    width: LengthWidth,
    max_payload_size: u32,
    state: Mutex<MuxState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl MuxInner {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        // Critical sections never panic; recover the guard if one ever did.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encode a frame, refusing payloads the peer could not decode.
    fn frame(&self, kind: u8, channel: u32, payload: Bytes) -> Result<OutboundFrame> {
        let length = u32::try_from(payload.len()).map_err(|_| {
            RamuxError::Protocol(format!("Payload size {} exceeds maximum", payload.len()))
        })?;
        let header = Header::new(kind, channel, length);
        header.validate(self.width, self.max_payload_size)?;
        Ok(OutboundFrame::new(&header, payload, self.width))
    }

    async fn send_frame(&self, kind: u8, channel: u32, payload: Bytes) -> Result<()> {
        let frame = self.frame(kind, channel, payload)?;
        self.writer.send(frame).await
    }

    /// Apply one inbound frame. Returns a frame to send back, if any.
    fn handle_frame(&self, frame: Frame) -> Option<OutboundFrame> {
        let remote = frame.channel();
        match frame.kind() {
            kind::OPEN => {
                let open = match OpenPayload::decode(frame.payload) {
                    Ok(open) => open,
                    Err(e) => {
                        tracing::warn!(channel = remote, error = %e, "dropping malformed OPEN");
                        return None;
                    }
                };
                self.handle_open(remote, open);
                None
            }
            kind::CLOSE => self.handle_close(remote),
            kind::MESSAGE => {
                let state = self.lock();
                let slot = state
                    .by_remote
                    .get(&remote)
                    .and_then(|local| state.channels.get(local));
                match slot {
                    Some(slot) => {
                        let _ = slot.inbound.send(frame.payload);
                    }
                    None => tracing::trace!(channel = remote, "message for unknown channel"),
                }
                None
            }
            other => {
                tracing::warn!(kind = other, "ignoring frame of unknown kind");
                None
            }
        }
    }

    fn handle_open(&self, remote: u32, open: OpenPayload) {
        let key = ChannelKey::new(open.protocol, open.id);
        let mut state = self.lock();

        if state.by_remote.contains_key(&remote) {
            tracing::warn!(channel = remote, key = %key, "duplicate OPEN for live channel");
            return;
        }

        let waiting = state
            .by_key
            .get(&key)
            .copied()
            .filter(|local| state.channels.get(local).is_some_and(|s| s.remote.is_none()));

        if let Some(local) = waiting {
            state.by_remote.insert(remote, local);
            if let Some(slot) = state.channels.get_mut(&local) {
                slot.remote = Some(remote);
                slot.state.send_replace(ChannelState::Open(open.handshake));
            }
            tracing::debug!(key = %key, local, remote, "channel open");
            return;
        }

        let previous = state.pending_remote.insert(
            key.clone(),
            RemoteOpen {
                remote,
                handshake: open.handshake,
            },
        );
        if previous.is_some() {
            tracing::warn!(key = %key, "peer re-opened a key that was never attached");
        }
        if let Some(waiters) = state.pair_waiters.remove(&key) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
        tracing::trace!(key = %key, remote, "peer OPEN pending");
    }

    fn handle_close(&self, remote: u32) -> Option<OutboundFrame> {
        let mut state = self.lock();

        if let Some(local) = state.by_remote.get(&remote).copied() {
            let slot = state.remove_local(local)?;
            tracing::debug!(key = %slot.key, local, remote, "channel closed by peer");
            drop(state);
            // Echo so the peer can drop an OPEN of ours it has not consumed.
            return self.frame(kind::CLOSE, local, Bytes::new()).ok();
        }

        let stale = state
            .pending_remote
            .iter()
            .find(|(_, open)| open.remote == remote)
            .map(|(key, _)| key.clone());
        if let Some(key) = stale {
            state.pending_remote.remove(&key);
            tracing::trace!(key = %key, remote, "peer withdrew pending OPEN");
        }
        None
    }

    fn destroy(&self) {
        let mut state = self.lock();
        if state.destroyed {
            return;
        }
        state.destroyed = true;

        let count = state.channels.len();
        for (_, slot) in state.channels.drain() {
            slot.mark_closed();
        }
        state.by_key.clear();
        state.by_remote.clear();
        state.pending_remote.clear();
        state.pair_waiters.clear();
        drop(state);
        tracing::debug!(channels = count, "mux destroyed");
        self.stop_tasks();
    }

    /// Abort both I/O tasks, releasing the stream so the peer sees EOF.
    fn stop_tasks(&self) {
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
        if let Some(writer) = self.writer_task.lock().ok().and_then(|mut w| w.take()) {
            writer.abort();
        }
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

/// Handle to a multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct Mux {
    inner: Arc<MuxInner>,
}

impl Mux {
    /// Start multiplexing `stream`, spawning its reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, config: MuxConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer);

        let inner = Arc::new(MuxInner {
            writer,
            width: config.length_width,
            max_payload_size: config.max_payload_size,
            state: Mutex::new(MuxState {
                next_local: 1,
                ..MuxState::default()
            }),
            reader: Mutex::new(None),
            writer_task: Mutex::new(Some(writer_task)),
        });

        let frames = FrameBuffer::with_max_payload(config.length_width, config.max_payload_size);
        let task = tokio::spawn(reader_loop(read_half, Arc::downgrade(&inner), frames));
        if let Ok(mut slot) = inner.reader.lock() {
            *slot = Some(task);
        }

        Mux { inner }
    }

    /// Open (or attach to) the channel for `key`.
    ///
    /// Returns the channel and its inbound message stream. Fails with
    /// `Protocol` if a live channel for `key` already exists on this side.
    pub async fn create_channel(
        &self,
        key: ChannelKey,
        handshake: Bytes,
    ) -> Result<(MuxChannel, mpsc::UnboundedReceiver<Bytes>)> {
        let open = OpenPayload {
            protocol: key.protocol.clone(),
            id: key.id.clone(),
            handshake,
        }
        .encode()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (channel, attached) = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(RamuxError::ChannelClosed);
            }
            if state.by_key.contains_key(&key) {
                return Err(RamuxError::Protocol(format!(
                    "Channel {} is already open on this connection",
                    key
                )));
            }

            let id = state.next_local;
            state.next_local = state.next_local.wrapping_add(1).max(1);

            let pending = state.pending_remote.remove(&key);
            let initial = match &pending {
                Some(open) => ChannelState::Open(open.handshake.clone()),
                None => ChannelState::Opening,
            };
            let (state_tx, state_rx) = watch::channel(initial);

            let remote = pending.map(|open| open.remote);
            if let Some(remote) = remote {
                state.by_remote.insert(remote, id);
            }
            state.by_key.insert(key.clone(), id);
            state.channels.insert(
                id,
                Slot {
                    key: key.clone(),
                    remote,
                    inbound: inbound_tx,
                    state: state_tx,
                },
            );

            let channel = MuxChannel {
                id,
                key,
                mux: self.clone(),
                state: state_rx,
            };
            (channel, remote.is_some())
        };

        tracing::debug!(key = %channel.key, local = channel.id, attached, "channel created");

        if let Err(e) = self.inner.send_frame(kind::OPEN, channel.id, open).await {
            self.inner.lock().remove_local(channel.id);
            return Err(e);
        }

        Ok((channel, inbound_rx))
    }

    /// Wait until the peer has sent an `OPEN` for `key` that no local
    /// channel has attached to yet.
    pub async fn pair(&self, key: &ChannelKey) -> Result<()> {
        let rx = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(RamuxError::ChannelClosed);
            }
            if state.pending_remote.contains_key(key) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.pair_waiters.entry(key.clone()).or_default().push(tx);
            rx
        };
        rx.await.map_err(|_| RamuxError::ChannelClosed)
    }

    /// Check if a live local channel exists for `key`.
    pub fn has_channel(&self, key: &ChannelKey) -> bool {
        self.inner.lock().by_key.contains_key(key)
    }

    /// Number of live local channels.
    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    /// Close every channel and stop both I/O tasks; the peer sees the
    /// stream end. Further `create_channel` calls fail with `ChannelClosed`.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Check if the connection is gone: destroyed, or its writer stopped.
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed || self.inner.writer.is_closed()
    }

    /// Queue one message. A payload too large for the connection's length
    /// prefix or payload limit fails with `Protocol` and nothing is sent.
    pub(crate) async fn send_message(&self, local: u32, payload: Bytes) -> Result<()> {
        self.inner.send_frame(kind::MESSAGE, local, payload).await
    }

    pub(crate) async fn close_local(&self, local: u32) {
        let removed = self.inner.lock().remove_local(local);
        let Some(slot) = removed else {
            return;
        };
        tracing::debug!(key = %slot.key, local, "channel closed");
        drop(slot);

        if let Err(e) = self.inner.send_frame(kind::CLOSE, local, Bytes::new()).await {
            tracing::trace!(local, error = %e, "CLOSE not sent");
        }
    }
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("channels", &self.channel_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

async fn reader_loop<R>(mut reader: R, mux: Weak<MuxInner>, mut frames: FrameBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let failure = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => n,
            Err(e) => break Some(RamuxError::Io(e)),
        };

        let batch = match frames.push(&buf[..n]) {
            Ok(batch) => batch,
            Err(e) => break Some(e),
        };

        let Some(inner) = mux.upgrade() else {
            return;
        };
        for frame in batch {
            if let Some(reply) = inner.handle_frame(frame) {
                if let Err(e) = inner.writer.send(reply).await {
                    tracing::trace!(error = %e, "reply not sent");
                }
            }
        }
    };

    match &failure {
        None => tracing::debug!("mux stream ended"),
        Some(e) => tracing::error!(error = %e, "mux reader failed"),
    }
    if let Some(inner) = mux.upgrade() {
        inner.destroy();
    }
}
