//! Wire format encoding and decoding.
//!
//! Implements the 20-byte header format:
//! ```text
//! ┌─────────┬────────┬────────┬──────────┬───────────┬────────────┬──────────┐
//! │ Version │ Op     │ Status │ Reserved │ Body size │ Request ID │ CRC-32   │
//! │ 1 byte  │ 1 byte │ 1 byte │ 1 byte   │ uint32 BE │ uint64 BE  │ uint32 BE│
//! └─────────┴────────┴────────┴──────────┴───────────┴────────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The checksum is CRC-32 (IEEE) over
//! the first 16 header bytes followed by the body.

use crc32fast::Hasher;

use crate::error::{LookupError, Result};

/// Header size in bytes (fixed, exactly 20).
pub const HEADER_SIZE: usize = 20;

/// Offset of the checksum field; everything before it is covered by the CRC.
pub const CHECKSUM_OFFSET: usize = 16;

/// The only protocol version this client speaks.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default maximum body size (1 MiB, enough for large bulk pages).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 1024 * 1024;

/// Request ID carried by one-way pushes.
pub const PUSH_REQUEST_ID: u64 = 0;

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Ping = 1,
    Pong = 2,
    Vl2Request = 3,
    Vl2Ack = 4,
    Vl3Request = 5,
    Vl3Ack = 6,
    BulkRequest = 7,
    BulkAck = 8,
    LogRequest = 9,
    LogRequestAck = 10,
    LogRecord = 11,
    LogAck = 12,
    Shootdown = 13,
}

impl OpCode {
    /// Every operation code, in numeric order.
    pub const ALL: [OpCode; 13] = [
        OpCode::Ping,
        OpCode::Pong,
        OpCode::Vl2Request,
        OpCode::Vl2Ack,
        OpCode::Vl3Request,
        OpCode::Vl3Ack,
        OpCode::BulkRequest,
        OpCode::BulkAck,
        OpCode::LogRequest,
        OpCode::LogRequestAck,
        OpCode::LogRecord,
        OpCode::LogAck,
        OpCode::Shootdown,
    ];

    /// Numeric wire value.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = LookupError;

    fn try_from(value: u8) -> Result<Self> {
        OpCode::ALL
            .iter()
            .copied()
            .find(|op| op.as_u8() == value)
            .ok_or(LookupError::UnknownOperation(value))
    }
}

/// Status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    MalformedRequest = 2,
    ServerError = 3,
    RetryLater = 4,
}

impl Status {
    /// Every status code, in numeric order.
    pub const ALL: [Status; 5] = [
        Status::Ok,
        Status::NotFound,
        Status::MalformedRequest,
        Status::ServerError,
        Status::RetryLater,
    ];

    /// Numeric wire value.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Check if this is the ok status.
    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl TryFrom<u8> for Status {
    type Error = LookupError;

    fn try_from(value: u8) -> Result<Self> {
        Status::ALL
            .iter()
            .copied()
            .find(|s| s.as_u8() == value)
            .ok_or_else(|| LookupError::malformed(format!("unknown status code {value}")))
    }
}

/// Decoded header from wire format.
///
/// Fields are kept raw; [`crate::protocol::registry`] turns them into typed
/// operation and status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version.
    pub version: u8,
    /// Operation code.
    pub op: u8,
    /// Status code.
    pub status: u8,
    /// Reserved, must be 0.
    pub reserved: u8,
    /// Body length in bytes.
    pub size: u32,
    /// Request identifier (0 = one-way push).
    pub request_id: u64,
    /// CRC-32 over header bytes 0..16 and the body.
    pub checksum: u32,
}

impl Header {
    /// Create the header for a body, computing its size and checksum.
    pub fn for_body(op: OpCode, status: Status, request_id: u64, body: &[u8]) -> Self {
        let mut header = Self {
            version: PROTOCOL_VERSION,
            op: op.as_u8(),
            status: status.as_u8(),
            reserved: 0,
            size: body.len() as u32,
            request_id,
            checksum: 0,
        };
        header.checksum = header.compute_checksum(body);
        header
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use overlay_lookup::protocol::{Header, OpCode, Status, HEADER_SIZE};
    ///
    /// let header = Header::for_body(OpCode::Ping, Status::Ok, 42, &[]);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (20 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        self.encode_prefix(&mut buf[..CHECKSUM_OFFSET]);
        buf[16..20].copy_from_slice(&self.checksum.to_be_bytes());
    }

    fn encode_prefix(&self, buf: &mut [u8]) {
        buf[0] = self.version;
        buf[1] = self.op;
        buf[2] = self.status;
        buf[3] = self.reserved;
        buf[4..8].copy_from_slice(&self.size.to_be_bytes());
        buf[8..16].copy_from_slice(&self.request_id.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use overlay_lookup::protocol::Header;
    ///
    /// let bytes = [1, 3, 0, 0, 0, 0, 0, 12, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0];
    /// let header = Header::decode(&bytes).unwrap();
    /// assert_eq!(header.op, 3);
    /// assert_eq!(header.size, 12);
    /// assert_eq!(header.request_id, 1);
    /// ```
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut size = [0u8; 4];
        size.copy_from_slice(&buf[4..8]);
        let mut request_id = [0u8; 8];
        request_id.copy_from_slice(&buf[8..16]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&buf[16..20]);

        Some(Self {
            version: buf[0],
            op: buf[1],
            status: buf[2],
            reserved: buf[3],
            size: u32::from_be_bytes(size),
            request_id: u64::from_be_bytes(request_id),
            checksum: u32::from_be_bytes(checksum),
        })
    }

    /// Validate the fields that do not depend on the operation.
    ///
    /// Checks:
    /// - Version is supported
    /// - Reserved byte is 0
    /// - Body size doesn't exceed max
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(LookupError::UnsupportedVersion(self.version));
        }

        if self.reserved != 0 {
            return Err(LookupError::malformed("reserved header byte must be 0"));
        }

        if self.size > max_body_size {
            return Err(LookupError::BodyTooLarge {
                size: self.size,
                max: max_body_size,
            });
        }

        Ok(())
    }

    /// Compute the checksum this header should carry for `body`.
    pub fn compute_checksum(&self, body: &[u8]) -> u32 {
        let mut prefix = [0u8; CHECKSUM_OFFSET];
        self.encode_prefix(&mut prefix);

        let mut hasher = Hasher::new();
        hasher.update(&prefix);
        hasher.update(body);
        hasher.finalize()
    }

    /// Verify the carried checksum against `body`.
    pub fn verify_checksum(&self, body: &[u8]) -> Result<()> {
        let actual = self.compute_checksum(body);
        if actual != self.checksum {
            return Err(LookupError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Check if this is a one-way push.
    #[inline]
    pub fn is_push(&self) -> bool {
        self.request_id == PUSH_REQUEST_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::for_body(OpCode::Vl2Request, Status::Ok, 42, &[0u8; 12]);
        let encoded = original.encode();
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header {
            version: 1,
            op: 0x03,
            status: 0x01,
            reserved: 0,
            size: 0x0A0B0C0D,
            request_id: 0x1112131415161718,
            checksum: 0x21222324,
        };
        let bytes = header.encode();

        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x03);
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x00);
        assert_eq!(&bytes[4..8], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(
            &bytes[8..16],
            &[0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18]
        );
        assert_eq!(&bytes[16..20], &[0x21, 0x22, 0x23, 0x24]);
    }

    #[test]
    fn test_header_size_is_exactly_20() {
        assert_eq!(HEADER_SIZE, 20);
        let header = Header::for_body(OpCode::Ping, Status::Ok, 1, &[]);
        assert_eq!(header.encode().len(), 20);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 19];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_checksum_covers_body_and_header() {
        let body = b"hello";
        let header = Header::for_body(OpCode::BulkRequest, Status::Ok, 9, body);
        assert!(header.verify_checksum(body).is_ok());

        // Body corruption
        let result = header.verify_checksum(b"hellp");
        assert!(matches!(result, Err(LookupError::ChecksumMismatch { .. })));

        // Header corruption
        let mut tampered = header;
        tampered.request_id = 10;
        assert!(tampered.verify_checksum(body).is_err());
    }

    #[test]
    fn test_validate_version() {
        let mut header = Header::for_body(OpCode::Ping, Status::Ok, 1, &[]);
        header.version = 2;
        let result = header.validate(DEFAULT_MAX_BODY_SIZE);
        assert!(matches!(result, Err(LookupError::UnsupportedVersion(2))));
    }

    #[test]
    fn test_validate_reserved_must_be_zero() {
        let mut header = Header::for_body(OpCode::Ping, Status::Ok, 1, &[]);
        header.reserved = 0x80;
        let result = header.validate(DEFAULT_MAX_BODY_SIZE);
        assert!(result.unwrap_err().to_string().contains("reserved"));
    }

    #[test]
    fn test_validate_body_too_large() {
        let mut header = Header::for_body(OpCode::BulkAck, Status::Ok, 1, &[]);
        header.size = 1_000_000;
        let result = header.validate(100);
        assert!(matches!(
            result,
            Err(LookupError::BodyTooLarge {
                size: 1_000_000,
                max: 100
            })
        ));
    }

    #[test]
    fn test_opcode_try_from() {
        for op in OpCode::ALL {
            assert_eq!(OpCode::try_from(op.as_u8()).unwrap(), op);
        }
        assert!(matches!(
            OpCode::try_from(0),
            Err(LookupError::UnknownOperation(0))
        ));
        assert!(OpCode::try_from(14).is_err());
    }

    #[test]
    fn test_status_try_from() {
        for status in Status::ALL {
            assert_eq!(Status::try_from(status.as_u8()).unwrap(), status);
        }
        assert!(Status::try_from(5).unwrap_err().is_malformed());
        assert!(Status::Ok.is_ok());
        assert!(!Status::NotFound.is_ok());
    }

    #[test]
    fn test_is_push() {
        let push = Header::for_body(OpCode::Shootdown, Status::Ok, PUSH_REQUEST_ID, &[]);
        assert!(push.is_push());
        let req = Header::for_body(OpCode::Ping, Status::Ok, 7, &[]);
        assert!(!req.is_push());
    }
}
