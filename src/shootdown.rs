//! Shootdown handling.
//!
//! A shootdown is a one-way push with no reply. Handling it means
//! invalidating the affected cache entries with a fresh stamp before the read
//! loop moves on to the next frame. Resolutions issued earlier carry older
//! stamps, so their acks can no longer write the invalidated entries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cache::{MappingCache, StampClock};
use crate::codec::Shootdown;
use crate::types::MappingKey;

/// Applies shootdowns to a [`MappingCache`].
pub struct ShootdownHandler {
    cache: Arc<dyn MappingCache>,
    clock: Arc<StampClock>,
    handled: AtomicU64,
}

impl ShootdownHandler {
    pub fn new(cache: Arc<dyn MappingCache>, clock: Arc<StampClock>) -> Self {
        Self {
            cache,
            clock,
            handled: AtomicU64::new(0),
        }
    }

    /// Invalidate the MAC and, when present, the IP named by a shootdown.
    pub fn on_shootdown(&self, shootdown: &Shootdown) {
        let stamp = self.clock.next();

        self.cache
            .invalidate(shootdown.vnet, MappingKey::Vl2(shootdown.mac), stamp);
        if let Some(ip) = shootdown.ip {
            self.cache.invalidate(shootdown.vnet, MappingKey::Vl3(ip), stamp);
        }

        self.handled.fetch_add(1, Ordering::Relaxed);
        debug!(
            vnet = %shootdown.vnet,
            mac = %shootdown.mac,
            ip = ?shootdown.ip,
            ?stamp,
            "shootdown applied"
        );
    }

    /// Number of shootdowns applied on this connection.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}
