//! Least-recently-used ordering of peers within a proximity bin.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use vertex_swarm_primitives::OverlayAddress;

use crate::ProximityBin;

/// Tracks when each peer was last chosen and orders candidates so the one
/// used longest ago comes first. Peers never used sort before all others;
/// ties break on overlay address.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    clock: AtomicU64,
    last_used: Mutex<HashMap<OverlayAddress, u64>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reorders the peers of every bin into least-recently-used order.
    pub fn order(&self, mut bins: Vec<ProximityBin>) -> Vec<ProximityBin> {
        let last_used = self.last_used.lock();
        for bin in &mut bins {
            bin.peers
                .sort_by_key(|p| (last_used.get(p).copied().unwrap_or(0), *p));
        }
        bins
    }

    /// Records that `peer` was chosen.
    pub fn add_use(&self, peer: &OverlayAddress) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_used.lock().insert(*peer, tick);
    }

    /// Forgets a disconnected peer.
    pub fn remove(&self, peer: &OverlayAddress) {
        self.last_used.lock().remove(peer);
    }
}
