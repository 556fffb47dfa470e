//! Frame struct with typed accessors.
//!
//! Represents a complete, registry-validated protocol frame: header plus raw
//! body. Uses `bytes::Bytes` for zero-copy body sharing.
//!
//! # Example
//!
//! ```
//! use overlay_lookup::protocol::{Frame, OpCode, Status};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(OpCode::LogRequestAck, Status::Ok, 42, Bytes::new());
//!
//! assert_eq!(frame.op(), OpCode::LogRequestAck);
//! assert_eq!(frame.request_id(), 42);
//! assert!(frame.body().is_empty());
//! ```

use bytes::Bytes;

use super::wire_format::{Header, OpCode, Status, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Operation, already checked against the registry.
    op: OpCode,
    /// Status, already checked against the registry.
    status: Status,
    /// Body bytes (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    /// Create a frame for a body, computing size and checksum.
    pub fn new(op: OpCode, status: Status, request_id: u64, body: Bytes) -> Self {
        let header = Header::for_body(op, status, request_id, &body);
        Self {
            header,
            op,
            status,
            body,
        }
    }

    /// Assemble a frame from a header that already passed validation.
    pub(crate) fn from_validated(header: Header, op: OpCode, status: Status, body: Bytes) -> Self {
        Self {
            header,
            op,
            status,
            body,
        }
    }

    /// Get a reference to the body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Get the body length.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Get the operation code.
    #[inline]
    pub fn op(&self) -> OpCode {
        self.op
    }

    /// Get the status code.
    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Get the request ID.
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Check if this is a one-way push.
    #[inline]
    pub fn is_push(&self) -> bool {
        self.header.is_push()
    }

    /// Encoded header and body, ready for vectored writes.
    pub fn encode_parts(&self) -> ([u8; HEADER_SIZE], Bytes) {
        (self.header.encode(), self.body.clone())
    }

    /// Encode as a single contiguous buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        build_frame(&self.header, &self.body)
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use overlay_lookup::protocol::{build_frame, Header, OpCode, Status, HEADER_SIZE};
///
/// let body = [0u8; 12];
/// let header = Header::for_body(OpCode::LogRequest, Status::Ok, 42, &body);
/// let bytes = build_frame(&header, &body);
/// assert_eq!(bytes.len(), HEADER_SIZE + 12);
/// ```
pub fn build_frame(header: &Header, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(
            OpCode::BulkRequest,
            Status::Ok,
            42,
            Bytes::from_static(b"\0\0\0\x07\0\0"),
        );

        assert_eq!(frame.op(), OpCode::BulkRequest);
        assert_eq!(frame.status(), Status::Ok);
        assert_eq!(frame.request_id(), 42);
        assert_eq!(frame.body_len(), 6);
        assert_eq!(frame.header.size, 6);
        assert!(frame.header.verify_checksum(frame.body()).is_ok());
    }

    #[test]
    fn test_frame_is_push() {
        let push = Frame::new(OpCode::LogRecord, Status::Ok, 0, Bytes::new());
        assert!(push.is_push());

        let ack = Frame::new(OpCode::Pong, Status::Ok, 3, Bytes::new());
        assert!(!ack.is_push());
    }

    #[test]
    fn test_encode_parts_zero_copy() {
        let body = Bytes::from_static(b"cursor");
        let frame = Frame::new(OpCode::BulkAck, Status::Ok, 1, body.clone());
        let (header, parts_body) = frame.encode_parts();

        assert_eq!(Header::decode(&header).unwrap(), frame.header);
        assert_eq!(parts_body.as_ptr(), body.as_ptr());
    }

    #[test]
    fn test_build_frame() {
        let frame = Frame::new(OpCode::Ping, Status::Ok, 9, Bytes::new());
        let bytes = frame.to_vec();

        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = Header::decode(&bytes).unwrap();
        assert_eq!(parsed, frame.header);
    }
}
