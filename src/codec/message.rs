//! Typed messages and their body layouts.
//!
//! Every operation has exactly one body variant. Acks answered with a non-ok
//! status carry no body and decode to [`Body::Nack`].
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use overlay_lookup::codec::{Body, Message, MessageCodec, Vl2Request};
//! use overlay_lookup::protocol::{Decoded, DEFAULT_MAX_BODY_SIZE};
//! use overlay_lookup::{MacAddr, VnetId};
//!
//! let msg = Message::request(
//!     1,
//!     Body::Vl2Request(Vl2Request {
//!         vnet: VnetId(7),
//!         mac: MacAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
//!     }),
//! );
//!
//! let mut buf = BytesMut::from(&MessageCodec::encode(&msg).unwrap()[..]);
//! let decoded = MessageCodec::decode(&mut buf, DEFAULT_MAX_BODY_SIZE).unwrap();
//! assert_eq!(decoded, Decoded::Complete(msg));
//! ```

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use super::body::{
    family_of, put_count, put_cursor, put_ip, put_mac, put_record, put_underlay, record_len,
    BodyReader, VL2_RECORD_LEN,
};
use crate::error::{LookupError, Result};
use crate::protocol::{
    decode_frame, Decoded, Frame, OpCode, Status, HEADER_SIZE, PUSH_REQUEST_ID,
};
use crate::types::{Cursor, MacAddr, MappingRecord, Vl3Resolution, VnetId};

const SHOOTDOWN_HAS_IP: u8 = 0x01;

/// Resolve a virtual MAC in a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vl2Request {
    pub vnet: VnetId,
    pub mac: MacAddr,
}

/// Resolve a virtual IP in a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vl3Request {
    pub vnet: VnetId,
    pub ip: IpAddr,
}

/// Ask for one page of a network's mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkRequest {
    pub vnet: VnetId,
    pub cursor: Cursor,
}

/// One page of mappings. An empty `next` cursor ends the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkAck {
    pub next: Cursor,
    pub records: Vec<MappingRecord>,
}

/// Subscribe to a network's log, starting at `from_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRequest {
    pub vnet: VnetId,
    pub from_seq: u64,
}

/// One entry of a network's change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub vnet: VnetId,
    pub seq: u64,
    pub record: MappingRecord,
}

/// Checkpoint: every record up to and including `seq` has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAck {
    pub vnet: VnetId,
    pub seq: u64,
}

/// Invalidate a MAC, and optionally the IP bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shootdown {
    pub vnet: VnetId,
    pub mac: MacAddr,
    pub ip: Option<IpAddr>,
}

/// Decoded body, one variant per operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Ping,
    Pong,
    Vl2Request(Vl2Request),
    /// Underlay endpoint. Underlays carry no family byte, so an IPv6
    /// endpoint in IPv4-mapped form (`::ffff:a.b.c.d`) decodes as IPv4.
    Vl2Ack(SocketAddr),
    Vl3Request(Vl3Request),
    /// Same underlay rule as [`Body::Vl2Ack`].
    Vl3Ack(Vl3Resolution),
    BulkRequest(BulkRequest),
    BulkAck(BulkAck),
    LogRequest(LogRequest),
    LogRequestAck,
    LogRecord(LogRecord),
    LogAck(LogAck),
    Shootdown(Shootdown),
    /// An ack with a non-ok status; the status lives on the [`Message`].
    Nack(OpCode),
}

impl Body {
    /// Operation this body belongs to.
    pub fn op(&self) -> OpCode {
        match self {
            Body::Ping => OpCode::Ping,
            Body::Pong => OpCode::Pong,
            Body::Vl2Request(_) => OpCode::Vl2Request,
            Body::Vl2Ack(_) => OpCode::Vl2Ack,
            Body::Vl3Request(_) => OpCode::Vl3Request,
            Body::Vl3Ack(_) => OpCode::Vl3Ack,
            Body::BulkRequest(_) => OpCode::BulkRequest,
            Body::BulkAck(_) => OpCode::BulkAck,
            Body::LogRequest(_) => OpCode::LogRequest,
            Body::LogRequestAck => OpCode::LogRequestAck,
            Body::LogRecord(_) => OpCode::LogRecord,
            Body::LogAck(_) => OpCode::LogAck,
            Body::Shootdown(_) => OpCode::Shootdown,
            Body::Nack(op) => *op,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Body::Ping | Body::Pong | Body::LogRequestAck | Body::Nack(_) => 0,
            Body::Vl2Request(_) => 12,
            Body::Vl2Ack(_) => 18,
            Body::Vl3Request(_) | Body::Vl3Ack(_) => 24,
            Body::BulkRequest(r) => 6 + r.cursor.len(),
            Body::BulkAck(a) => 6 + a.next.len() + a.records.iter().map(record_len).sum::<usize>(),
            Body::LogRequest(_) | Body::LogAck(_) => 12,
            Body::LogRecord(r) => 12 + record_len(&r.record),
            Body::Shootdown(_) => 28,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Body::Ping | Body::Pong | Body::LogRequestAck | Body::Nack(_) => {}
            Body::Vl2Request(r) => {
                buf.put_u32(r.vnet.get());
                put_mac(buf, &r.mac);
                buf.put_u16(0);
            }
            Body::Vl2Ack(underlay) => put_underlay(buf, underlay),
            Body::Vl3Request(r) => {
                buf.put_u32(r.vnet.get());
                buf.put_u8(family_of(&r.ip));
                buf.put_slice(&[0u8; 3]);
                put_ip(buf, &r.ip);
            }
            Body::Vl3Ack(res) => {
                put_mac(buf, &res.mac);
                put_underlay(buf, &res.underlay);
            }
            Body::BulkRequest(r) => {
                buf.put_u32(r.vnet.get());
                put_cursor(buf, &r.cursor)?;
            }
            Body::BulkAck(a) => {
                put_cursor(buf, &a.next)?;
                put_count(buf, a.records.len())?;
                for record in &a.records {
                    put_record(buf, record);
                }
            }
            Body::LogRequest(r) => {
                buf.put_u32(r.vnet.get());
                buf.put_u64(r.from_seq);
            }
            Body::LogRecord(r) => {
                buf.put_u32(r.vnet.get());
                buf.put_u64(r.seq);
                put_record(buf, &r.record);
            }
            Body::LogAck(a) => {
                buf.put_u32(a.vnet.get());
                buf.put_u64(a.seq);
            }
            Body::Shootdown(s) => {
                buf.put_u32(s.vnet.get());
                put_mac(buf, &s.mac);
                match &s.ip {
                    Some(ip) => {
                        buf.put_u8(SHOOTDOWN_HAS_IP);
                        buf.put_u8(family_of(ip));
                        put_ip(buf, ip);
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_u8(0);
                        buf.put_slice(&[0u8; 16]);
                    }
                }
            }
        }
        Ok(())
    }

    fn decode(op: OpCode, status: Status, body: &[u8]) -> Result<Body> {
        if !status.is_ok() {
            // Registry already enforced an empty body.
            return Ok(Body::Nack(op));
        }

        let mut r = BodyReader::new(body, op_name(op));
        let decoded = match op {
            OpCode::Ping => Body::Ping,
            OpCode::Pong => Body::Pong,
            OpCode::LogRequestAck => Body::LogRequestAck,
            OpCode::Vl2Request => {
                let vnet = VnetId(r.u32()?);
                let mac = r.mac()?;
                r.skip(2)?;
                Body::Vl2Request(Vl2Request { vnet, mac })
            }
            OpCode::Vl2Ack => Body::Vl2Ack(r.underlay()?),
            OpCode::Vl3Request => {
                let vnet = VnetId(r.u32()?);
                let family = r.u8()?;
                r.skip(3)?;
                let ip = r.ip(family)?;
                Body::Vl3Request(Vl3Request { vnet, ip })
            }
            OpCode::Vl3Ack => {
                let mac = r.mac()?;
                let underlay = r.underlay()?;
                Body::Vl3Ack(Vl3Resolution { mac, underlay })
            }
            OpCode::BulkRequest => {
                let vnet = VnetId(r.u32()?);
                let len = r.u16()? as usize;
                let cursor = Cursor(Bytes::copy_from_slice(r.bytes(len)?));
                Body::BulkRequest(BulkRequest { vnet, cursor })
            }
            OpCode::BulkAck => {
                let len = r.u16()? as usize;
                let next = Cursor(Bytes::copy_from_slice(r.bytes(len)?));
                let count = r.u32()? as usize;
                if count > r.remaining() / VL2_RECORD_LEN {
                    return Err(LookupError::malformed(format!(
                        "bulk-ack claims {} records in {} bytes",
                        count,
                        r.remaining()
                    )));
                }
                let mut records = Vec::with_capacity(count);
                for _ in 0..count {
                    records.push(r.record()?);
                }
                Body::BulkAck(BulkAck { next, records })
            }
            OpCode::LogRequest => {
                let vnet = VnetId(r.u32()?);
                let from_seq = r.u64()?;
                Body::LogRequest(LogRequest { vnet, from_seq })
            }
            OpCode::LogRecord => {
                let vnet = VnetId(r.u32()?);
                let seq = r.u64()?;
                let record = r.record()?;
                Body::LogRecord(LogRecord { vnet, seq, record })
            }
            OpCode::LogAck => {
                let vnet = VnetId(r.u32()?);
                let seq = r.u64()?;
                Body::LogAck(LogAck { vnet, seq })
            }
            OpCode::Shootdown => {
                let vnet = VnetId(r.u32()?);
                let mac = r.mac()?;
                let flags = r.u8()?;
                if flags & !SHOOTDOWN_HAS_IP != 0 {
                    return Err(LookupError::malformed(format!(
                        "shootdown carries unknown flags 0x{flags:02x}"
                    )));
                }
                let family = r.u8()?;
                let ip = if flags & SHOOTDOWN_HAS_IP != 0 {
                    Some(r.ip(family)?)
                } else {
                    r.skip(16)?;
                    None
                };
                Body::Shootdown(Shootdown { vnet, mac, ip })
            }
        };

        r.finish()?;
        Ok(decoded)
    }
}

fn op_name(op: OpCode) -> &'static str {
    crate::protocol::registry::spec(op).name
}

/// A decoded message: correlation id, status and typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub request_id: u64,
    pub status: Status,
    pub body: Body,
}

impl Message {
    /// A request or ok ack carrying `body`.
    pub fn request(request_id: u64, body: Body) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            body,
        }
    }

    /// An ack with an ok status.
    pub fn ack(request_id: u64, body: Body) -> Self {
        Self::request(request_id, body)
    }

    /// An ack that answers `op` with an error status and no body.
    pub fn nack(request_id: u64, op: OpCode, status: Status) -> Self {
        Self {
            request_id,
            status,
            body: Body::Nack(op),
        }
    }

    /// A one-way push.
    pub fn push(body: Body) -> Self {
        Self::request(PUSH_REQUEST_ID, body)
    }

    /// Operation code of this message.
    pub fn op(&self) -> OpCode {
        self.body.op()
    }
}

/// Stateless encoder/decoder between [`Message`] and wire bytes.
pub struct MessageCodec;

impl MessageCodec {
    /// Encode the body of a message.
    ///
    /// # Errors
    ///
    /// [`LookupError::TooLong`] if a cursor or record list does not fit its
    /// length field.
    pub fn encode_body(message: &Message) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(message.body.encoded_len());
        message.body.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Build the frame for a message.
    pub fn to_frame(message: &Message) -> Result<Frame> {
        Ok(Frame::new(
            message.op(),
            message.status,
            message.request_id,
            Self::encode_body(message)?,
        ))
    }

    /// Encode a message as one contiguous buffer.
    pub fn encode(message: &Message) -> Result<Bytes> {
        let frame = Self::to_frame(message)?;
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.body().len());
        buf.put_slice(&frame.header.encode());
        buf.put_slice(frame.body());
        Ok(buf.freeze())
    }

    /// Decode the body of a registry-validated frame.
    ///
    /// # Errors
    ///
    /// Returns a malformed-input error if the body does not match the
    /// operation's layout exactly.
    pub fn from_frame(frame: &Frame) -> Result<Message> {
        let body = Body::decode(frame.op(), frame.status(), frame.body())?;
        Ok(Message {
            request_id: frame.request_id(),
            status: frame.status(),
            body,
        })
    }

    /// Take one message off the front of a reassembly buffer.
    pub fn decode(buf: &mut BytesMut, max_body_size: u32) -> Result<Decoded<Message>> {
        match decode_frame(buf, max_body_size)? {
            Decoded::Complete(frame) => Ok(Decoded::Complete(Self::from_frame(&frame)?)),
            Decoded::NeedMoreData => Ok(Decoded::NeedMoreData),
        }
    }
}
