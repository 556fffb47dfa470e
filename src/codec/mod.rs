//! Codec module - typed messages over the framing layer.
//!
//! - [`MessageCodec`] - stateless `encode` / `decode` between [`Message`] and bytes
//! - [`Body`] - one variant per operation code
//!
//! # Design
//!
//! The codec is a marker struct with static methods. Decoding takes a
//! caller-owned reassembly buffer and never retains state of its own.

mod body;
mod message;

pub use body::{FAMILY_IPV4, FAMILY_IPV6, MAX_CURSOR_LEN, RECORD_VL2, RECORD_VL3};
pub use message::{
    Body, BulkAck, BulkRequest, LogAck, LogRecord, LogRequest, Message, MessageCodec, Shootdown,
    Vl2Request, Vl3Request,
};
