//! Error types for overlay-lookup.

use thiserror::Error;

use crate::protocol::{OpCode, Status};
use crate::types::VnetId;

/// Main error type for all lookup operations.
#[derive(Debug, Error)]
pub enum LookupError {
    /// I/O error on the underlying byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol violation or corrupt body (fatal to the connection).
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Header carries a version this client does not speak.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Header carries an operation code missing from the registry.
    #[error("Unknown operation code: {0}")]
    UnknownOperation(u8),

    /// Header checksum does not match the received bytes.
    #[error("Checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Declared body size exceeds the configured maximum.
    #[error("Body size {size} exceeds maximum {max}")]
    BodyTooLarge { size: u32, max: u32 },

    /// No ack arrived within the timeout window after all retries.
    #[error("Request {request_id} timed out")]
    Timeout { request_id: u64 },

    /// Transport failed or the connection was torn down.
    #[error("Connection lost")]
    ConnectionLost,

    /// The caller abandoned the request.
    #[error("Request cancelled")]
    Cancelled,

    /// A request id was reused while its previous use is still in flight.
    #[error("Request id {0} is already in flight")]
    DuplicateRequestId(u64),

    /// Only request operations can be submitted for correlation.
    #[error("{0:?} is not a request operation")]
    NotARequest(OpCode),

    /// Every request id is currently in flight.
    #[error("No free request ids")]
    RequestIdsExhausted,

    /// The server answered with an error status.
    #[error("Server answered {op:?} with status {status:?}")]
    Server { op: OpCode, status: Status },

    /// The server answered with a well-formed but unexpected message.
    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    /// A value does not fit the width of its wire length field.
    #[error("{what} is {len} long, the wire format allows at most {max}")]
    TooLong {
        what: &'static str,
        len: usize,
        max: usize,
    },

    /// A log subscription for the network is already active.
    #[error("Log for network {0} is already subscribed")]
    AlreadySubscribed(VnetId),

    /// Outbound queue stayed full past the backpressure timeout.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl LookupError {
    /// Shorthand for a [`LookupError::Malformed`] with a formatted reason.
    pub fn malformed(reason: impl Into<String>) -> Self {
        LookupError::Malformed(reason.into())
    }

    /// Whether this error means the peer's byte stream can no longer be trusted.
    ///
    /// Malformed input terminates the connection; it never terminates the process.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            LookupError::Malformed(_)
                | LookupError::UnsupportedVersion(_)
                | LookupError::UnknownOperation(_)
                | LookupError::ChecksumMismatch { .. }
                | LookupError::BodyTooLarge { .. }
        )
    }
}

/// Result type alias using LookupError.
pub type Result<T> = std::result::Result<T, LookupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_classification() {
        assert!(LookupError::malformed("bad").is_malformed());
        assert!(LookupError::UnknownOperation(99).is_malformed());
        assert!(LookupError::BodyTooLarge { size: 10, max: 5 }.is_malformed());
        assert!(LookupError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_malformed());

        assert!(!LookupError::ConnectionLost.is_malformed());
        assert!(!LookupError::Timeout { request_id: 1 }.is_malformed());
        assert!(!LookupError::DuplicateRequestId(1).is_malformed());
        assert!(!LookupError::TooLong {
            what: "cursor",
            len: 70_000,
            max: 65_535
        }
        .is_malformed());
    }

    #[test]
    fn test_display_messages() {
        let err = LookupError::Server {
            op: OpCode::Vl2Ack,
            status: Status::RetryLater,
        };
        assert_eq!(
            err.to_string(),
            "Server answered Vl2Ack with status RetryLater"
        );

        let err = LookupError::ChecksumMismatch {
            expected: 0xDEADBEEF,
            actual: 0x1,
        };
        assert!(err.to_string().contains("0xdeadbeef"));
    }
}
