//! Reassembly of frames from an unstructured byte stream.
//!
//! [`decode_frame`] is the stateless decoder: it inspects a caller-owned
//! `BytesMut` and either consumes one complete frame, reports that more data
//! is needed (consuming nothing), or fails with a malformed-input error.
//! [`FrameBuffer`] owns such a buffer and extracts every complete frame from
//! each chunk pushed into it.
//!
//! # Example
//!
//! ```ignore
//! use overlay_lookup::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let frames = buffer.push(&chunk)?;
//!
//! for frame in frames {
//!     println!("Got {:?} for request {}", frame.op(), frame.request_id());
//! }
//! ```

use bytes::BytesMut;

use super::registry;
use super::wire_format::{Header, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Outcome of one incremental decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A complete item was consumed from the buffer.
    Complete(T),
    /// The buffer holds a partial item; nothing was consumed.
    NeedMoreData,
}

/// Try to take one complete frame off the front of `buf`.
///
/// The header is validated against the registry as soon as it is available,
/// so an oversized or unknown frame is rejected before its body arrives.
pub fn decode_frame(buf: &mut BytesMut, max_body_size: u32) -> Result<Decoded<Frame>> {
    let header = match Header::decode(&buf[..]) {
        Some(h) => h,
        None => return Ok(Decoded::NeedMoreData),
    };

    let (op, status) = registry::validate(&header, max_body_size)?;

    let total = HEADER_SIZE + header.size as usize;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    let _ = buf.split_to(HEADER_SIZE);
    let body = buf.split_to(header.size as usize).freeze();

    header.verify_checksum(&body)?;

    Ok(Decoded::Complete(Frame::from_validated(
        header, op, status, body,
    )))
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max body: 1MiB.
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a new frame buffer with custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns a malformed-input error on the first invalid frame. The
    /// connection should be dropped; the buffer contents are unspecified.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.extend(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Append received bytes without decoding.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// Frames ahead of a malformed one are returned before the error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match decode_frame(&mut self.buffer, self.max_body_size)? {
            Decoded::Complete(frame) => Ok(Some(frame)),
            Decoded::NeedMoreData => Ok(None),
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
