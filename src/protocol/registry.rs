//! Operation registry.
//!
//! Single table describing every operation: whether it is a request, the ack
//! answering a request, or a one-way push, and the body shape it must carry.
//! Header validation goes through [`validate`]; adding an operation means
//! adding an [`OpCode`] variant and one row to [`REGISTRY`].

use super::wire_format::{Header, OpCode, Status, PUSH_REQUEST_ID};
use crate::error::{LookupError, Result};

/// Who sends a one-way push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Lookup service to client.
    ToClient,
    /// Client to lookup service.
    ToServer,
}

/// Role of an operation in the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Expects exactly one ack carrying the same request id.
    Request { ack: OpCode },
    /// Answers the given request operation.
    Ack { answers: OpCode },
    /// One-way message with request id 0 and no reply.
    Push { direction: Direction },
}

/// Expected body length for a status-ok message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyShape {
    Fixed(u32),
    AtLeast(u32),
}

impl BodyShape {
    /// Whether `size` fits this shape.
    pub fn accepts(self, size: u32) -> bool {
        match self {
            BodyShape::Fixed(n) => size == n,
            BodyShape::AtLeast(n) => size >= n,
        }
    }
}

/// Registry row.
#[derive(Debug, Clone, Copy)]
pub struct OpSpec {
    pub op: OpCode,
    pub name: &'static str,
    pub kind: OpKind,
    pub shape: BodyShape,
    /// Whether a not-found status is a valid answer (acks only).
    pub allows_not_found: bool,
}

/// Every known operation, indexed by `op as u8 - 1`.
pub static REGISTRY: [OpSpec; 13] = [
    OpSpec {
        op: OpCode::Ping,
        name: "ping",
        kind: OpKind::Request { ack: OpCode::Pong },
        shape: BodyShape::Fixed(0),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::Pong,
        name: "pong",
        kind: OpKind::Ack {
            answers: OpCode::Ping,
        },
        shape: BodyShape::Fixed(0),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::Vl2Request,
        name: "vl2-request",
        kind: OpKind::Request {
            ack: OpCode::Vl2Ack,
        },
        shape: BodyShape::Fixed(12),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::Vl2Ack,
        name: "vl2-ack",
        kind: OpKind::Ack {
            answers: OpCode::Vl2Request,
        },
        shape: BodyShape::Fixed(18),
        allows_not_found: true,
    },
    OpSpec {
        op: OpCode::Vl3Request,
        name: "vl3-request",
        kind: OpKind::Request {
            ack: OpCode::Vl3Ack,
        },
        shape: BodyShape::Fixed(24),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::Vl3Ack,
        name: "vl3-ack",
        kind: OpKind::Ack {
            answers: OpCode::Vl3Request,
        },
        shape: BodyShape::Fixed(24),
        allows_not_found: true,
    },
    OpSpec {
        op: OpCode::BulkRequest,
        name: "bulk-request",
        kind: OpKind::Request {
            ack: OpCode::BulkAck,
        },
        shape: BodyShape::AtLeast(6),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::BulkAck,
        name: "bulk-ack",
        kind: OpKind::Ack {
            answers: OpCode::BulkRequest,
        },
        shape: BodyShape::AtLeast(6),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::LogRequest,
        name: "log-request",
        kind: OpKind::Request {
            ack: OpCode::LogRequestAck,
        },
        shape: BodyShape::Fixed(12),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::LogRequestAck,
        name: "log-request-ack",
        kind: OpKind::Ack {
            answers: OpCode::LogRequest,
        },
        shape: BodyShape::Fixed(0),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::LogRecord,
        name: "log-record",
        kind: OpKind::Push {
            direction: Direction::ToClient,
        },
        shape: BodyShape::AtLeast(13),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::LogAck,
        name: "log-ack",
        kind: OpKind::Push {
            direction: Direction::ToServer,
        },
        shape: BodyShape::Fixed(12),
        allows_not_found: false,
    },
    OpSpec {
        op: OpCode::Shootdown,
        name: "shootdown",
        kind: OpKind::Push {
            direction: Direction::ToClient,
        },
        shape: BodyShape::Fixed(28),
        allows_not_found: false,
    },
];

/// Look up the registry row for an operation.
#[inline]
pub fn spec(op: OpCode) -> &'static OpSpec {
    &REGISTRY[op.as_u8() as usize - 1]
}

/// The ack operation answering a request operation, `None` for acks and pushes.
pub fn ack_for(op: OpCode) -> Option<OpCode> {
    match spec(op).kind {
        OpKind::Request { ack } => Some(ack),
        _ => None,
    }
}

/// Whether `ack` is the operation that answers `request`.
pub fn answers(ack: OpCode, request: OpCode) -> bool {
    matches!(spec(ack).kind, OpKind::Ack { answers } if answers == request)
}

/// Body shape expected for `op` carrying `status`.
///
/// Acks with a non-ok status carry no body.
pub fn expected_shape(op: OpCode, status: Status) -> BodyShape {
    if status.is_ok() {
        spec(op).shape
    } else {
        BodyShape::Fixed(0)
    }
}

/// Validate a decoded header against the registry.
///
/// Returns the typed operation and status on success. Every failure is a
/// connection-fatal protocol violation.
pub fn validate(header: &Header, max_body_size: u32) -> Result<(OpCode, Status)> {
    header.validate(max_body_size)?;

    let op = OpCode::try_from(header.op)?;
    let status = Status::try_from(header.status)?;
    let spec = spec(op);

    match spec.kind {
        OpKind::Request { .. } => {
            if !status.is_ok() {
                return Err(LookupError::malformed(format!(
                    "{} carries status {:?}",
                    spec.name, status
                )));
            }
            if header.request_id == PUSH_REQUEST_ID {
                return Err(LookupError::malformed(format!(
                    "{} carries request id 0",
                    spec.name
                )));
            }
        }
        OpKind::Ack { .. } => {
            if header.request_id == PUSH_REQUEST_ID {
                return Err(LookupError::malformed(format!(
                    "{} carries request id 0",
                    spec.name
                )));
            }
            if status == Status::NotFound && !spec.allows_not_found {
                return Err(LookupError::malformed(format!(
                    "{} cannot answer not-found",
                    spec.name
                )));
            }
        }
        OpKind::Push { .. } => {
            if !status.is_ok() {
                return Err(LookupError::malformed(format!(
                    "{} carries status {:?}",
                    spec.name, status
                )));
            }
            if header.request_id != PUSH_REQUEST_ID {
                return Err(LookupError::malformed(format!(
                    "{} carries request id {}",
                    spec.name, header.request_id
                )));
            }
        }
    }

    if !expected_shape(op, status).accepts(header.size) {
        return Err(LookupError::malformed(format!(
            "{} with status {:?} cannot carry a {}-byte body",
            spec.name, status, header.size
        )));
    }

    Ok((op, status))
}
