//! Single writer for a connection's write half.
//!
//! Channels never touch the stream. They hand encoded frames to a
//! [`WriterHandle`], and one task drains the queue, coalescing every frame
//! that is already waiting into a single vectored write.
//!
//! ```text
//! channel 1 ─┐
//! channel 2 ─┼─► queue ─► writer task ─► write_vectored ─► stream
//! replies   ─┘
//! ```
//!
//! Frames leave in queue order, so each channel's messages reach the peer
//! in the order they were sent.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{RamuxError, Result};
use crate::protocol::{Header, LengthWidth, MAX_HEADER_SIZE};

/// Default number of unwritten frames a connection tolerates before
/// senders start waiting.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default capacity of the frame queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default limit on how long a sender waits for the backlog to shrink.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_FRAMES_PER_WRITE: usize = 64;

/// An encoded header plus its payload, ready for the wire.
#[derive(Debug)]
pub struct OutboundFrame {
    header: [u8; MAX_HEADER_SIZE],
    header_len: usize,
    payload: Bytes,
}

impl OutboundFrame {
    pub fn new(header: &Header, payload: Bytes, width: LengthWidth) -> Self {
        let (header, header_len) = header.encode(width);
        Self {
            header,
            header_len,
            payload,
        }
    }

    #[inline]
    fn head(&self) -> &[u8] {
        &self.header[..self.header_len]
    }

    /// Bytes this frame occupies on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.header_len + self.payload.len()
    }
}

/// Writer queue limits.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Unwritten frames allowed before `send` waits.
    pub max_pending_frames: usize,
    /// Capacity of the mpsc queue feeding the task.
    pub channel_capacity: usize,
    /// How long `send` waits for the backlog before failing.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Frames queued but not yet written, shared by handles and the task.
#[derive(Default)]
struct Backlog {
    frames: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    fn len(&self) -> usize {
        self.frames.load(Ordering::Acquire)
    }

    fn add(&self) {
        self.frames.fetch_add(1, Ordering::AcqRel);
    }

    fn remove(&self, n: usize) {
        self.frames.fetch_sub(n, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Queues frames for the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    backlog: Arc<Backlog>,
    limit: usize,
    stall_timeout: Duration,
}

impl WriterHandle {
    /// Queue `frame`. While the backlog is at its limit this waits for the
    /// task to catch up, failing with `BackpressureTimeout` if it does not.
    ///
    /// Fails with `ChannelClosed` once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            tokio::time::timeout(self.stall_timeout, self.wait_for_room())
                .await
                .map_err(|_| RamuxError::BackpressureTimeout)?;
        }

        self.backlog.add();
        if self.tx.send(frame).await.is_err() {
            self.backlog.remove(1);
            return Err(RamuxError::ChannelClosed);
        }
        Ok(())
    }

    async fn wait_for_room(&self) {
        loop {
            let drained = self.backlog.drained.notified();
            if !self.is_backpressure_active() {
                return;
            }
            drained.await;
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backlog.len() >= self.limit
    }

    /// Check if the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the writer task for `writer`.
///
/// The task shuts the stream down and ends once every [`WriterHandle`] is
/// gone. The first failed write stops it with that error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let backlog = Arc::new(Backlog::default());
    let handle = WriterHandle {
        tx,
        backlog: backlog.clone(),
        limit: config.max_pending_frames,
        stall_timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(async move {
        let result = drain(rx, writer, &backlog).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "writer stopped");
        } else {
            tracing::trace!("writer finished");
        }
        result
    });

    (handle, task)
}

async fn drain<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    backlog: &Backlog,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut ready = Vec::with_capacity(MAX_FRAMES_PER_WRITE);

    while rx.recv_many(&mut ready, MAX_FRAMES_PER_WRITE).await > 0 {
        let written = write_frames(&mut writer, &ready).await;
        backlog.remove(ready.len());
        ready.clear();
        if let Err(e) = written {
            rx.close();
            return Err(e);
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write every byte of `frames`, resuming after short vectored writes.
async fn write_frames<W>(writer: &mut W, frames: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = frames.iter().map(OutboundFrame::size).sum();
    let mut done = 0;

    while done < total {
        let slices = unwritten_slices(frames, done);
        match writer.write_vectored(&slices).await? {
            0 => {
                return Err(RamuxError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "stream accepted no bytes",
                )))
            }
            n => done += n,
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip` bytes of `frames`.
fn unwritten_slices(frames: &[OutboundFrame], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(frames.len() * 2);
    let mut start_of_part = 0;

    for part in frames.iter().flat_map(|f| [f.head(), &f.payload[..]]) {
        let end_of_part = start_of_part + part.len();
        if skip < end_of_part && !part.is_empty() {
            slices.push(IoSlice::new(&part[skip.saturating_sub(start_of_part)..]));
        }
        start_of_part = end_of_part;
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{kind, FrameBuffer};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn message(channel: u32, payload: &'static [u8]) -> OutboundFrame {
        let header = Header::new(kind::MESSAGE, channel, payload.len() as u32);
        OutboundFrame::new(&header, Bytes::from_static(payload), LengthWidth::Bits32)
    }

    #[test]
    fn test_outbound_frame_size() {
        let frame = message(1, b"hello");
        assert_eq!(frame.head().len(), 9);
        assert_eq!(frame.size(), 14);

        let close = OutboundFrame::new(&Header::new(kind::CLOSE, 1, 0), Bytes::new(), LengthWidth::Bits16);
        assert_eq!(close.size(), 7);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_queue_order() {
        let (near, mut far) = duplex(4096);
        let (handle, _task) = spawn_writer_task(near, WriterConfig::default());

        for channel in 0..10u32 {
            let payload = Bytes::copy_from_slice(&channel.to_be_bytes());
            let header = Header::new(kind::MESSAGE, channel, 4);
            handle
                .send(OutboundFrame::new(&header, payload, LengthWidth::Bits32))
                .await
                .unwrap();
        }

        let mut decoder = FrameBuffer::new(LengthWidth::Bits32);
        let mut received = Vec::new();
        let mut chunk = [0u8; 256];
        while received.len() < 10 {
            let n = far.read(&mut chunk).await.unwrap();
            received.extend(decoder.push(&chunk[..n]).unwrap());
        }

        let channels: Vec<u32> = received.iter().map(|f| f.channel()).collect();
        assert_eq!(channels, (0..10).collect::<Vec<_>>());
        assert_eq!(received[7].payload(), &7u32.to_be_bytes());
        assert_eq!(handle.backlog.len(), 0);
    }

    #[tokio::test]
    async fn test_send_fails_once_writer_stopped() {
        let (near, far) = duplex(64);
        drop(far);
        let (handle, task) = spawn_writer_task(near, WriterConfig::default());

        let _ = handle.send(message(1, b"x")).await;
        assert!(task.await.unwrap().is_err());

        assert!(matches!(
            handle.send(message(1, b"y")).await,
            Err(RamuxError::ChannelClosed)
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_full_backlog_times_out() {
        let (tx, _rx) = mpsc::channel(4);
        let backlog = Arc::new(Backlog::default());
        for _ in 0..3 {
            backlog.add();
        }
        let handle = WriterHandle {
            tx,
            backlog,
            limit: 3,
            stall_timeout: Duration::from_millis(10),
        };

        assert!(handle.is_backpressure_active());
        assert!(matches!(
            handle.send(message(1, b"x")).await,
            Err(RamuxError::BackpressureTimeout)
        ));
    }

    #[tokio::test]
    async fn test_waiting_sender_resumes_when_drained() {
        let (tx, mut rx) = mpsc::channel(4);
        let backlog = Arc::new(Backlog::default());
        backlog.add();
        let handle = WriterHandle {
            tx,
            backlog: backlog.clone(),
            limit: 1,
            stall_timeout: Duration::from_secs(1),
        };

        let sender = tokio::spawn(async move { handle.send(message(2, b"later")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        backlog.remove(1);
        sender.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, Bytes::from_static(b"later"));
    }

    #[test]
    fn test_unwritten_slices_skip_written_prefix() {
        let frames = [message(1, b"hello"), message(2, b"abc")];
        assert_eq!(unwritten_slices(&frames, 0).len(), 4);

        let rest = unwritten_slices(&frames, 5);
        assert_eq!(rest.len(), 4);
        assert_eq!(rest[0].len(), 4);

        let tail = unwritten_slices(&frames, 9 + 5 + 9);
        assert_eq!(tail.len(), 1);
        assert_eq!(&tail[0][..], b"abc");
    }

    #[tokio::test]
    async fn test_many_frames_in_one_write() {
        let mut sink = Cursor::new(Vec::new());
        let frames: Vec<_> = (0..5).map(|i| message(i, b"abc")).collect();
        write_frames(&mut sink, &frames).await.unwrap();
        assert_eq!(sink.into_inner().len(), 5 * 12);
    }

    #[tokio::test]
    async fn test_dropping_handles_ends_task() {
        let (near, _far) = duplex(4096);
        let (handle, task) = spawn_writer_task(near, WriterConfig::default());
        drop(handle);
        assert!(task.await.unwrap().is_ok());
    }
}
