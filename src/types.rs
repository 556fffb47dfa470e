//! Identity and mapping types shared by the codec, the cache and the client.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use bytes::Bytes;

use crate::error::{LookupError, Result};

/// Virtual network identifier (the VXLAN network id of an overlay).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VnetId(pub u32);

impl VnetId {
    /// Raw numeric value.
    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for VnetId {
    fn from(id: u32) -> Self {
        VnetId(id)
    }
}

impl fmt::Display for VnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 48-bit virtual MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Create a MAC address from its six octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    /// The six octets in transmission order.
    #[inline]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = LookupError;

    /// Parse `AA:BB:CC:DD:EE:FF` (case-insensitive, one or two hex digits per octet).
    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| LookupError::Config(format!("invalid MAC address: {s}")))?;
            if part.is_empty() || part.len() > 2 {
                return Err(LookupError::Config(format!("invalid MAC address: {s}")));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| LookupError::Config(format!("invalid MAC address: {s}")))?;
        }

        if parts.next().is_some() {
            return Err(LookupError::Config(format!("invalid MAC address: {s}")));
        }

        Ok(MacAddr(octets))
    }
}

/// Result of a single lookup.
///
/// `NotFound` is a successful protocol exchange: the service answered and has
/// no mapping. `Stale` carries a value that was invalidated by a shootdown
/// while the request was in flight; it was not written to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    Stale(T),
    NotFound,
}

impl<T> Lookup<T> {
    /// Whether a fresh mapping was returned.
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    /// Whether the service reported no mapping.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Lookup::NotFound)
    }

    /// The fresh value, if any.
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// A VL2 mapping: virtual MAC to the underlay endpoint that hosts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vl2Mapping {
    pub mac: MacAddr,
    pub underlay: SocketAddr,
}

/// A VL3 mapping: virtual IP to its owning virtual MAC and underlay endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vl3Mapping {
    pub ip: IpAddr,
    pub mac: MacAddr,
    pub underlay: SocketAddr,
}

/// Answer to a VL3 resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vl3Resolution {
    pub mac: MacAddr,
    pub underlay: SocketAddr,
}

/// One mapping carried by a bulk page or a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingRecord {
    Vl2(Vl2Mapping),
    Vl3(Vl3Mapping),
}

impl MappingRecord {
    /// The cache key this record writes.
    pub fn key(&self) -> MappingKey {
        match self {
            MappingRecord::Vl2(m) => MappingKey::Vl2(m.mac),
            MappingRecord::Vl3(m) => MappingKey::Vl3(m.ip),
        }
    }
}

/// Identity a cache entry is keyed by within one virtual network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKey {
    Vl2(MacAddr),
    Vl3(IpAddr),
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingKey::Vl2(mac) => write!(f, "vl2 {mac}"),
            MappingKey::Vl3(ip) => write!(f, "vl3 {ip}"),
        }
    }
}

/// Opaque bulk resumption cursor. The empty cursor starts a walk, and an
/// empty continuation ends it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Cursor(pub Bytes);

impl Cursor {
    /// The cursor that starts a bulk walk from the beginning.
    pub fn start() -> Self {
        Cursor(Bytes::new())
    }

    /// Whether this is the empty cursor.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cursor length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<&'static [u8]> for Cursor {
    fn from(bytes: &'static [u8]) -> Self {
        Cursor(Bytes::from_static(bytes))
    }
}

/// One page of a bulk resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPage {
    pub records: Vec<MappingRecord>,
    /// Cursor for the next call, `None` once the walk is complete.
    pub next: Option<Cursor>,
}

impl BulkPage {
    /// Whether the server signalled the end of the walk.
    pub fn is_done(&self) -> bool {
        self.next.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display() {
        let mac = MacAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(mac.to_string(), "AA:BB:CC:DD:EE:FF");

        let mac = MacAddr::new([0x78, 0x45, 0xc4, 0x26, 0x89, 0x4a]);
        assert_eq!(mac.to_string(), "78:45:C4:26:89:4A");
    }

    #[test]
    fn test_mac_parse() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        let short: MacAddr = "0:1:2:a:b:c".parse().unwrap();
        assert_eq!(short.octets(), [0, 1, 2, 0xA, 0xB, 0xC]);
    }

    #[test]
    fn test_mac_parse_rejects_garbage() {
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:zz".parse::<MacAddr>().is_err());
        assert!("aaa:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
        assert!("aa::cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_lookup_accessors() {
        let found: Lookup<u32> = Lookup::Found(7);
        assert!(found.is_found());
        assert_eq!(found.found(), Some(7));

        let stale: Lookup<u32> = Lookup::Stale(7);
        assert!(!stale.is_found());
        assert_eq!(stale.found(), None);

        assert!(Lookup::<u32>::NotFound.is_not_found());
    }

    #[test]
    fn test_record_key() {
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let underlay: SocketAddr = "10.0.0.1:4789".parse().unwrap();
        let ip: IpAddr = "192.168.1.10".parse().unwrap();

        let vl2 = MappingRecord::Vl2(Vl2Mapping { mac, underlay });
        assert_eq!(vl2.key(), MappingKey::Vl2(mac));

        let vl3 = MappingRecord::Vl3(Vl3Mapping { ip, mac, underlay });
        assert_eq!(vl3.key(), MappingKey::Vl3(ip));
    }

    #[test]
    fn test_cursor() {
        assert!(Cursor::start().is_empty());
        let c = Cursor::from(&b"page-2"[..]);
        assert_eq!(c.len(), 6);
        assert!(!c.is_empty());
    }
}
