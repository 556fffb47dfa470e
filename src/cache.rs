//! Stamped mapping cache.
//!
//! Every write carries a [`Stamp`] taken from the connection's [`StampClock`].
//! Resolutions are stamped when their request is issued, and shootdowns and
//! log records when they arrive. A write only lands if it is newer than what
//! the cache already knows about the key (including a tombstone left by an
//! invalidation) and newer than the last network-wide invalidation. An answer
//! to a request issued before a shootdown therefore can never resurrect the
//! invalidated mapping.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::types::{MacAddr, MappingKey, MappingRecord, Vl3Resolution, VnetId};

/// Logical time of a cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Stamp(pub u64);

/// Monotonic source of [`Stamp`]s. Every call to [`StampClock::next`] returns
/// a stamp strictly greater than all earlier ones.
#[derive(Debug, Default)]
pub struct StampClock {
    last: AtomicU64,
}

impl StampClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh stamp.
    pub fn next(&self) -> Stamp {
        Stamp(self.last.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// The most recently issued stamp.
    pub fn current(&self) -> Stamp {
        Stamp(self.last.load(Ordering::Acquire))
    }
}

/// Destination for resolved and pushed mappings.
///
/// Implemented by the caller's cache. Calls come from the connection's read
/// loop and from resolution callers, so implementations must be thread safe
/// and must not block for long.
pub trait MappingCache: Send + Sync {
    /// Write a mapping observed at `stamp`.
    ///
    /// Returns `false` if a newer write or invalidation already covers the key,
    /// in which case the record must not be stored.
    fn store(&self, vnet: VnetId, record: &MappingRecord, stamp: Stamp) -> bool;

    /// Drop the mapping for `key` and refuse older writes to it.
    fn invalidate(&self, vnet: VnetId, key: MappingKey, stamp: Stamp);

    /// Drop every mapping of a network and refuse writes older than `stamp`.
    fn invalidate_network(&self, vnet: VnetId, stamp: Stamp);

    /// Forget bookkeeping that only matters to writes older than `before`.
    ///
    /// No write stamped before `before` will be attempted afterwards.
    fn prune(&self, _before: Stamp) {}
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Live { record: MappingRecord, stamp: Stamp },
    Tombstone { stamp: Stamp },
}

impl Entry {
    fn stamp(&self) -> Stamp {
        match self {
            Entry::Live { stamp, .. } | Entry::Tombstone { stamp } => *stamp,
        }
    }
}

#[derive(Debug, Default)]
struct Network {
    floor: Stamp,
    entries: HashMap<MappingKey, Entry>,
}

/// In-memory [`MappingCache`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    networks: RwLock<HashMap<VnetId, Network>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live mapping for `key`, if any.
    pub fn get(&self, vnet: VnetId, key: MappingKey) -> Option<MappingRecord> {
        let networks = self.networks.read();
        match networks.get(&vnet)?.entries.get(&key)? {
            Entry::Live { record, .. } => Some(*record),
            Entry::Tombstone { .. } => None,
        }
    }

    /// Underlay endpoint cached for a MAC.
    pub fn get_vl2(&self, vnet: VnetId, mac: MacAddr) -> Option<SocketAddr> {
        match self.get(vnet, MappingKey::Vl2(mac))? {
            MappingRecord::Vl2(m) => Some(m.underlay),
            MappingRecord::Vl3(_) => None,
        }
    }

    /// MAC and underlay endpoint cached for an IP.
    pub fn get_vl3(&self, vnet: VnetId, ip: IpAddr) -> Option<Vl3Resolution> {
        match self.get(vnet, MappingKey::Vl3(ip))? {
            MappingRecord::Vl3(m) => Some(Vl3Resolution {
                mac: m.mac,
                underlay: m.underlay,
            }),
            MappingRecord::Vl2(_) => None,
        }
    }

    /// Number of live mappings in a network.
    pub fn len(&self, vnet: VnetId) -> usize {
        self.networks.read().get(&vnet).map_or(0, |n| {
            n.entries
                .values()
                .filter(|e| matches!(e, Entry::Live { .. }))
                .count()
        })
    }

    /// Whether a network has no live mappings.
    pub fn is_empty(&self, vnet: VnetId) -> bool {
        self.len(vnet) == 0
    }

    /// Every live mapping of a network, in no particular order.
    pub fn records(&self, vnet: VnetId) -> Vec<MappingRecord> {
        self.networks.read().get(&vnet).map_or_else(Vec::new, |n| {
            n.entries
                .values()
                .filter_map(|e| match e {
                    Entry::Live { record, .. } => Some(*record),
                    Entry::Tombstone { .. } => None,
                })
                .collect()
        })
    }

    #[cfg(test)]
    fn tombstones(&self) -> usize {
        self.networks
            .read()
            .values()
            .flat_map(|n| n.entries.values())
            .filter(|e| matches!(e, Entry::Tombstone { .. }))
            .count()
    }
}

impl MappingCache for MemoryCache {
    fn store(&self, vnet: VnetId, record: &MappingRecord, stamp: Stamp) -> bool {
        let mut networks = self.networks.write();
        let network = networks.entry(vnet).or_default();
        let key = record.key();

        if stamp <= network.floor {
            trace!(%vnet, %key, ?stamp, floor = ?network.floor, "store refused by network floor");
            return false;
        }
        if let Some(existing) = network.entries.get(&key) {
            if existing.stamp() >= stamp {
                trace!(%vnet, %key, ?stamp, "store refused by newer entry");
                return false;
            }
        }

        network.entries.insert(
            key,
            Entry::Live {
                record: *record,
                stamp,
            },
        );
        true
    }

    fn invalidate(&self, vnet: VnetId, key: MappingKey, stamp: Stamp) {
        let mut networks = self.networks.write();
        let network = networks.entry(vnet).or_default();

        match network.entries.get(&key) {
            Some(existing) if existing.stamp() > stamp => {}
            _ => {
                network.entries.insert(key, Entry::Tombstone { stamp });
            }
        }
    }

    fn invalidate_network(&self, vnet: VnetId, stamp: Stamp) {
        let mut networks = self.networks.write();
        let network = networks.entry(vnet).or_default();
        network.floor = network.floor.max(stamp);
        network.entries.clear();
    }

    fn prune(&self, before: Stamp) {
        let mut networks = self.networks.write();
        networks.retain(|_, network| {
            network
                .entries
                .retain(|_, e| !matches!(e, Entry::Tombstone { stamp } if *stamp < before));
            !(network.entries.is_empty() && network.floor < before)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Vl2Mapping, Vl3Mapping};

    const VNET: VnetId = VnetId(7);
    const MAC: MacAddr = MacAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

    fn vl2(port: u16) -> MappingRecord {
        MappingRecord::Vl2(Vl2Mapping {
            mac: MAC,
            underlay: SocketAddr::new("203.0.113.5".parse().unwrap(), port),
        })
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let clock = StampClock::new();
        assert_eq!(clock.current(), Stamp(0));
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
        assert_eq!(clock.current(), b);
    }

    #[test]
    fn test_store_and_get() {
        let cache = MemoryCache::new();
        assert!(cache.store(VNET, &vl2(4789), Stamp(1)));

        assert_eq!(
            cache.get_vl2(VNET, MAC),
            Some("203.0.113.5:4789".parse().unwrap())
        );
        assert_eq!(cache.get_vl2(VnetId(8), MAC), None);
        assert_eq!(cache.len(VNET), 1);
    }

    #[test]
    fn test_newer_write_wins() {
        let cache = MemoryCache::new();
        assert!(cache.store(VNET, &vl2(1), Stamp(5)));
        assert!(!cache.store(VNET, &vl2(2), Stamp(3)));
        assert_eq!(cache.get_vl2(VNET, MAC).unwrap().port(), 1);

        assert!(cache.store(VNET, &vl2(3), Stamp(6)));
        assert_eq!(cache.get_vl2(VNET, MAC).unwrap().port(), 3);
    }

    #[test]
    fn test_invalidate_refuses_older_store() {
        let cache = MemoryCache::new();
        // Request issued at 1, shootdown at 2, ack arrives after.
        cache.invalidate(VNET, MappingKey::Vl2(MAC), Stamp(2));
        assert!(!cache.store(VNET, &vl2(4789), Stamp(1)));
        assert_eq!(cache.get_vl2(VNET, MAC), None);

        // Requests issued after the shootdown land normally.
        assert!(cache.store(VNET, &vl2(4789), Stamp(3)));
        assert!(cache.get_vl2(VNET, MAC).is_some());
    }

    #[test]
    fn test_invalidate_network_sets_floor() {
        let cache = MemoryCache::new();
        let vl3 = MappingRecord::Vl3(Vl3Mapping {
            ip: "10.0.0.5".parse().unwrap(),
            mac: MAC,
            underlay: "203.0.113.5:4789".parse().unwrap(),
        });
        cache.store(VNET, &vl2(1), Stamp(1));
        cache.store(VNET, &vl3, Stamp(2));
        cache.store(VnetId(9), &vl2(1), Stamp(3));

        cache.invalidate_network(VNET, Stamp(4));

        assert!(cache.is_empty(VNET));
        assert_eq!(cache.len(VnetId(9)), 1);
        assert!(!cache.store(VNET, &vl3, Stamp(4)));
        assert!(cache.store(VNET, &vl3, Stamp(5)));
        assert_eq!(cache.records(VNET), vec![vl3]);
    }

    #[test]
    fn test_prune_drops_old_tombstones_only() {
        let cache = MemoryCache::new();
        cache.invalidate(VNET, MappingKey::Vl2(MAC), Stamp(2));
        cache.invalidate(VNET, MappingKey::Vl3("10.0.0.1".parse().unwrap()), Stamp(8));
        assert_eq!(cache.tombstones(), 2);

        cache.prune(Stamp(5));
        assert_eq!(cache.tombstones(), 1);

        cache.prune(Stamp(9));
        assert_eq!(cache.tombstones(), 0);
    }

    #[test]
    fn test_prune_keeps_recent_floor() {
        let cache = MemoryCache::new();
        cache.invalidate_network(VNET, Stamp(10));
        cache.prune(Stamp(5));
        assert!(!cache.store(VNET, &vl2(1), Stamp(7)));
    }
}
