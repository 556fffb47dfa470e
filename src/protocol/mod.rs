//! Protocol module - wire format, registry, and framing.
//!
//! This module implements the binary framing layer:
//! - 20-byte header encoding/decoding with CRC-32
//! - Operation registry (which op/status/size combinations are legal)
//! - Stateless frame decoding plus a reassembly buffer for partial reads
//! - Frame struct with typed accessors

mod frame;
mod frame_buffer;
pub mod registry;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::{decode_frame, Decoded, FrameBuffer};
pub use registry::{BodyShape, Direction, OpKind, OpSpec};
pub use wire_format::{
    Header, OpCode, Status, CHECKSUM_OFFSET, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, PROTOCOL_VERSION,
    PUSH_REQUEST_ID,
};
