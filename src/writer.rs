//! Dedicated writer task for outbound frames.
//!
//! Requests, retransmissions, checkpoints and pongs are produced by several
//! tasks at once. Instead of sharing the write half behind a mutex, every
//! producer holds a [`WriterHandle`] and pushes encoded frames into an mpsc
//! channel drained by a single task.
//!
//! ```text
//! resolve_vl2 ─┐
//! tick loop   ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► stream
//! read loop   ─┘
//! ```
//!
//! Ready frames are batched into one `write_vectored` call, and a pending
//! counter applies backpressure to producers when the peer stops reading.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::codec::{Message, MessageCodec};
use crate::error::{LookupError, Result};
use crate::protocol::{Frame, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
///
/// Cloning is cheap: the body is reference counted, so the correlation
/// tracker keeps one copy for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Body bytes (empty for pings, pongs and nacks).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Encode a typed message.
    pub fn from_message(message: &Message) -> Result<Self> {
        Ok(Self::from(&MessageCodec::to_frame(message)?))
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl From<&Frame> for OutboundFrame {
    fn from(frame: &Frame) -> Self {
        let (header, payload) = frame.encode_parts();
        Self { header, payload }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Milliseconds to wait for backpressure to clear.
    pub backpressure_timeout_ms: u64,
}

impl WriterConfig {
    /// Backpressure timeout as a `Duration`.
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Frames queued or being written, shared by the handles and the task.
#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

impl Pending {
    fn load(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self, frames: usize) {
        self.count.fetch_sub(frames, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<Pending>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundFrame>,
        pending: Arc<Pending>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Send a frame to the writer task.
    ///
    /// Waits while backpressure is active, failing after the configured
    /// timeout.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            self.wait_for_drain().await?;
        }

        self.pending.add();
        self.tx.send(frame).await.map_err(|_| {
            self.pending.release(1);
            LookupError::ConnectionLost
        })
    }

    async fn wait_for_drain(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;

        loop {
            // Register before checking so a release in between is not missed.
            let drained = self.pending.drained.notified();
            if !self.is_backpressure_active() {
                return Ok(());
            }
            if self.tx.is_closed() {
                return Err(LookupError::ConnectionLost);
            }
            tokio::time::timeout_at(deadline, drained)
                .await
                .map_err(|_| LookupError::BackpressureTimeout)?;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load() >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load()
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send without waiting.
    ///
    /// Used from synchronous contexts such as retransmission after a tick.
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(LookupError::BackpressureTimeout);
        }

        self.pending.add();
        self.tx.try_send(frame).map_err(|e| {
            self.pending.release(1);
            match e {
                mpsc::error::TrySendError::Full(_) => LookupError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => LookupError::ConnectionLost,
            }
        })
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task finishes with `Ok(())` once every handle is dropped, or with the
/// first I/O error.
pub fn spawn_writer_task<W>(
    writer: W,
    config: &WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(Pending::default());

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending_frames,
        config.backpressure_timeout(),
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<Pending>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while rx.recv_many(&mut batch, MAX_BATCH_SIZE).await > 0 {
        let result = write_batch(&mut writer, &batch).await;
        pending.release(batch.len());
        batch.clear();

        if let Err(e) = result {
            debug!(error = %e, "outbound write failed, stopping writer");
            rx.close();
            return Err(e);
        }
    }

    debug!("writer channel closed, shutting down");
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames with scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();

    let mut total_written = writer.write_vectored(&slices).await?;
    if total_written == 0 {
        return Err(write_zero());
    }

    while total_written < total_size {
        let remaining = unwritten_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }

        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

fn write_zero() -> LookupError {
    LookupError::Io(std::io::Error::new(
        std::io::ErrorKind::WriteZero,
        "write_vectored returned 0",
    ))
}

/// Slices for whatever follows the first `skip_bytes` bytes of `batch`.
fn unwritten_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        let header_start = skipped;
        let header_end = skipped + HEADER_SIZE;

        if skip_bytes < header_end {
            let start_in_header = skip_bytes.saturating_sub(header_start);
            slices.push(IoSlice::new(&frame.header[start_in_header..]));
        }
        skipped = header_end;

        if !frame.payload.is_empty() {
            let payload_start = skipped;
            let payload_end = skipped + frame.payload.len();

            if skip_bytes < payload_end {
                let start_in_payload = skip_bytes.saturating_sub(payload_start);
                slices.push(IoSlice::new(&frame.payload[start_in_payload..]));
            }
            skipped = payload_end;
        }
    }

    slices
}
