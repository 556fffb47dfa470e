//! Checked readers and writers for body fields.
//!
//! Addresses always occupy 16 bytes on the wire. IPv4 travels as an
//! IPv4-mapped IPv6 address; where the family matters it is carried in a
//! separate byte ([`FAMILY_IPV4`] / [`FAMILY_IPV6`]). Underlay endpoints carry
//! no family byte and decode a mapped address back to IPv4.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{LookupError, Result};
use crate::types::{Cursor, MacAddr, MappingRecord, Vl2Mapping, Vl3Mapping};

/// Address family byte for IPv4.
pub const FAMILY_IPV4: u8 = 1;
/// Address family byte for IPv6.
pub const FAMILY_IPV6: u8 = 2;

/// Tag of a VL2 mapping record.
pub const RECORD_VL2: u8 = 1;
/// Tag of a VL3 mapping record.
pub const RECORD_VL3: u8 = 2;

/// Encoded length of a VL2 record including its tag.
pub const VL2_RECORD_LEN: usize = 1 + 6 + 2 + 16;
/// Encoded length of a VL3 record including its tag.
pub const VL3_RECORD_LEN: usize = 1 + 1 + 16 + 6 + 2 + 16;

/// Longest cursor the `u16` length prefix can describe.
pub const MAX_CURSOR_LEN: usize = u16::MAX as usize;

/// Bounds-checked cursor over a body.
///
/// Every read fails with a malformed error instead of panicking when the body
/// is short.
pub(crate) struct BodyReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> BodyReader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn ensure(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(LookupError::malformed(format!(
                "{} body truncated: need {} more bytes, have {}",
                self.what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<()> {
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.ensure(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn mac(&mut self) -> Result<MacAddr> {
        Ok(MacAddr(self.array::<6>()?))
    }

    /// Read a 16-byte address whose family was given separately.
    pub(crate) fn ip(&mut self, family: u8) -> Result<IpAddr> {
        let v6 = Ipv6Addr::from(self.array::<16>()?);
        match family {
            FAMILY_IPV4 => v6.to_ipv4_mapped().map(IpAddr::V4).ok_or_else(|| {
                LookupError::malformed(format!(
                    "{} address {} is not IPv4-mapped",
                    self.what, v6
                ))
            }),
            FAMILY_IPV6 => Ok(IpAddr::V6(v6)),
            other => Err(LookupError::malformed(format!(
                "{} carries unknown address family {}",
                self.what, other
            ))),
        }
    }

    /// Read a 16-byte underlay address; mapped addresses come back as IPv4.
    pub(crate) fn underlay_ip(&mut self) -> Result<IpAddr> {
        let v6 = Ipv6Addr::from(self.array::<16>()?);
        Ok(match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        })
    }

    /// Read `port u16, addr 16`.
    pub(crate) fn underlay(&mut self) -> Result<SocketAddr> {
        let port = self.u16()?;
        let ip = self.underlay_ip()?;
        Ok(SocketAddr::new(ip, port))
    }

    /// Read one tagged mapping record.
    pub(crate) fn record(&mut self) -> Result<MappingRecord> {
        match self.u8()? {
            RECORD_VL2 => {
                let mac = self.mac()?;
                let underlay = self.underlay()?;
                Ok(MappingRecord::Vl2(Vl2Mapping { mac, underlay }))
            }
            RECORD_VL3 => {
                let family = self.u8()?;
                let ip = self.ip(family)?;
                let mac = self.mac()?;
                let underlay = self.underlay()?;
                Ok(MappingRecord::Vl3(Vl3Mapping { ip, mac, underlay }))
            }
            tag => Err(LookupError::malformed(format!(
                "{} carries unknown record tag {}",
                self.what, tag
            ))),
        }
    }

    /// Fail if any bytes are left over.
    pub(crate) fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(LookupError::malformed(format!(
                "{} body has {} trailing bytes",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Family byte for an address.
pub(crate) fn family_of(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => FAMILY_IPV4,
        IpAddr::V6(_) => FAMILY_IPV6,
    }
}

/// Write an address as 16 bytes (IPv4 mapped into IPv6).
pub(crate) fn put_ip(buf: &mut BytesMut, ip: &IpAddr) {
    let v6 = match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => *v6,
    };
    buf.put_slice(&v6.octets());
}

pub(crate) fn put_mac(buf: &mut BytesMut, mac: &MacAddr) {
    buf.put_slice(&mac.octets());
}

/// Write `port u16, addr 16`.
pub(crate) fn put_underlay(buf: &mut BytesMut, addr: &SocketAddr) {
    buf.put_u16(addr.port());
    put_ip(buf, &addr.ip());
}

/// Write `len u16, bytes`.
pub(crate) fn put_cursor(buf: &mut BytesMut, cursor: &Cursor) -> Result<()> {
    let len = u16::try_from(cursor.len()).map_err(|_| LookupError::TooLong {
        what: "cursor",
        len: cursor.len(),
        max: MAX_CURSOR_LEN,
    })?;
    buf.put_u16(len);
    buf.put_slice(&cursor.0);
    Ok(())
}

/// Write a `u32` record count.
pub(crate) fn put_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    let count = u32::try_from(count).map_err(|_| LookupError::TooLong {
        what: "record list",
        len: count,
        max: u32::MAX as usize,
    })?;
    buf.put_u32(count);
    Ok(())
}

/// Write one tagged mapping record.
pub(crate) fn put_record(buf: &mut BytesMut, record: &MappingRecord) {
    match record {
        MappingRecord::Vl2(m) => {
            buf.put_u8(RECORD_VL2);
            put_mac(buf, &m.mac);
            put_underlay(buf, &m.underlay);
        }
        MappingRecord::Vl3(m) => {
            buf.put_u8(RECORD_VL3);
            buf.put_u8(family_of(&m.ip));
            put_ip(buf, &m.ip);
            put_mac(buf, &m.mac);
            put_underlay(buf, &m.underlay);
        }
    }
}

/// Encoded length of a record including its tag.
pub(crate) fn record_len(record: &MappingRecord) -> usize {
    match record {
        MappingRecord::Vl2(_) => VL2_RECORD_LEN,
        MappingRecord::Vl3(_) => VL3_RECORD_LEN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    #[test]
    fn test_put_cursor_at_limit() {
        let mut buf = BytesMut::new();
        let cursor = Cursor(Bytes::from(vec![7u8; MAX_CURSOR_LEN]));
        put_cursor(&mut buf, &cursor).unwrap();
        assert_eq!(&buf[..2], &[0xFF, 0xFF]);
        assert_eq!(buf.len(), 2 + MAX_CURSOR_LEN);
    }

    #[test]
    fn test_put_cursor_over_limit_rejected() {
        let mut buf = BytesMut::new();
        let cursor = Cursor(Bytes::from(vec![7u8; MAX_CURSOR_LEN + 1]));
        let err = put_cursor(&mut buf, &cursor).unwrap_err();
        assert!(matches!(
            err,
            LookupError::TooLong {
                what: "cursor",
                len: 65_536,
                ..
            }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reader_truncation_is_malformed() {
        let data = [0u8; 3];
        let mut reader = BodyReader::new(&data, "test");
        let err = reader.u32().unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn test_reader_trailing_bytes_rejected() {
        let data = [0u8; 5];
        let mut reader = BodyReader::new(&data, "test");
        reader.u32().unwrap();
        assert!(reader.finish().unwrap_err().to_string().contains("trailing"));
    }

    #[test]
    fn test_ipv4_is_mapped_on_the_wire() {
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));
        let mut buf = BytesMut::new();
        put_ip(&mut buf, &ip);

        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(&buf[10..12], &[0xFF, 0xFF]);
        assert_eq!(&buf[12..], &[203, 0, 113, 5]);

        let mut reader = BodyReader::new(&buf, "test");
        assert_eq!(reader.ip(FAMILY_IPV4).unwrap(), ip);
    }

    #[test]
    fn test_ipv4_family_requires_mapped_address() {
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let octets = v6.octets();
        let mut reader = BodyReader::new(&octets, "test");
        assert!(reader.ip(FAMILY_IPV4).unwrap_err().is_malformed());
    }

    #[test]
    fn test_unknown_family_rejected() {
        let octets = [0u8; 16];
        let mut reader = BodyReader::new(&octets, "test");
        let err = reader.ip(9).unwrap_err();
        assert!(err.to_string().contains("family"));
    }

    #[test]
    fn test_underlay_roundtrip() {
        let v4: SocketAddr = "203.0.113.5:4789".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::5]:4789".parse().unwrap();

        for addr in [v4, v6] {
            let mut buf = BytesMut::new();
            put_underlay(&mut buf, &addr);
            assert_eq!(buf.len(), 18);

            let mut reader = BodyReader::new(&buf, "test");
            assert_eq!(reader.underlay().unwrap(), addr);
            reader.finish().unwrap();
        }
    }

    #[test]
    fn test_record_lengths() {
        let mac = MacAddr::new([2, 0, 0, 0, 0, 9]);
        let underlay: SocketAddr = "10.1.1.1:4789".parse().unwrap();

        let vl2 = MappingRecord::Vl2(Vl2Mapping { mac, underlay });
        let mut buf = BytesMut::new();
        put_record(&mut buf, &vl2);
        assert_eq!(buf.len(), VL2_RECORD_LEN);
        assert_eq!(record_len(&vl2), VL2_RECORD_LEN);

        let vl3 = MappingRecord::Vl3(Vl3Mapping {
            ip: "192.168.0.9".parse().unwrap(),
            mac,
            underlay,
        });
        let mut buf = BytesMut::new();
        put_record(&mut buf, &vl3);
        assert_eq!(buf.len(), VL3_RECORD_LEN);

        let mut reader = BodyReader::new(&buf, "test");
        assert_eq!(reader.record().unwrap(), vl3);
    }

    #[test]
    fn test_unknown_record_tag() {
        let data = [7u8; 30];
        let mut reader = BodyReader::new(&data, "bulk-ack");
        assert!(reader.record().unwrap_err().to_string().contains("record tag"));
    }
}
