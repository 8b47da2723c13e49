//! Kademlia routing table.
//!
//! Organizes connected peers by their proximity order (PO) to the local
//! overlay address.
//!
//! # Bins
//!
//! Bin N contains peers with PO = N to the local address, N in
//! `0..=MAX_PO`. Peers sharing more than `MAX_PO` leading bits with us all
//! land in the deepest bin.
//!
//! # Depth
//!
//! The neighbourhood depth is the deepest bin `D` such that at least
//! `min_neighbourhood_size` peers have PO >= `D`, capped at the shallowest
//! empty bin. A node is responsible for chunks with PO >= depth to its
//! overlay. Every change is published on a watch channel.

mod peer;

pub use peer::KademliaPeer;

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::debug;
use vertex_swarm_primitives::{MAX_PO, NUM_BINS, OverlayAddress, SwarmAddress};

use crate::{Capability, ProximityBin, Topology};

/// Configuration for the Kademlia routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KademliaConfig {
    /// Peers required at or beyond depth.
    pub min_neighbourhood_size: usize,

    /// Maximum peers per bin.
    pub max_bin_size: usize,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            min_neighbourhood_size: 2,
            max_bin_size: 16,
        }
    }
}

#[derive(Debug)]
struct Table {
    /// `bins[i]` contains peers with PO = i to the local address.
    bins: Vec<Vec<KademliaPeer>>,
    /// overlay -> bin index
    peers: HashMap<OverlayAddress, usize>,
}

/// The Kademlia routing table.
#[derive(Debug)]
pub struct Kademlia {
    local: OverlayAddress,
    config: KademliaConfig,
    table: RwLock<Table>,
    depth: watch::Sender<u8>,
}

impl Kademlia {
    /// Create a new, empty routing table.
    pub fn new(local: OverlayAddress, config: KademliaConfig) -> Self {
        Self {
            local,
            config,
            table: RwLock::new(Table {
                bins: vec![Vec::new(); NUM_BINS],
                peers: HashMap::new(),
            }),
            depth: watch::channel(0).0,
        }
    }

    /// Get the local overlay address.
    pub fn local(&self) -> &OverlayAddress {
        &self.local
    }

    /// Add a connected peer.
    ///
    /// Returns `true` if the peer was added, `false` if it is ourselves,
    /// already present, or its bin is full.
    pub fn add(&self, peer: KademliaPeer) -> bool {
        let overlay = peer.overlay;
        if overlay == self.local {
            return false;
        }

        let po = self.local.proximity(&overlay) as usize;
        {
            let mut table = self.table.write();
            if table.peers.contains_key(&overlay) {
                return false;
            }
            let Some(bin) = table.bins.get_mut(po) else {
                return false;
            };
            if bin.len() >= self.config.max_bin_size {
                debug!(%overlay, po, "Bin full, not adding peer");
                return false;
            }
            bin.push(peer);
            table.peers.insert(overlay, po);
        }

        debug!(%overlay, po, "Added peer");
        self.update_depth();
        true
    }

    /// Remove a peer from the routing table.
    pub fn remove(&self, overlay: &OverlayAddress) -> Option<KademliaPeer> {
        let removed = {
            let mut table = self.table.write();
            let po = table.peers.remove(overlay)?;
            let bin = table.bins.get_mut(po)?;
            let pos = bin.iter().position(|p| &p.overlay == overlay)?;
            bin.remove(pos)
        };

        debug!(%overlay, "Removed peer");
        self.update_depth();
        Some(removed)
    }

    /// Get a peer by overlay address.
    pub fn get(&self, overlay: &OverlayAddress) -> Option<KademliaPeer> {
        let table = self.table.read();
        let po = *table.peers.get(overlay)?;
        table
            .bins
            .get(po)?
            .iter()
            .find(|p| &p.overlay == overlay)
            .cloned()
    }

    /// Check if a peer is in the routing table.
    pub fn contains(&self, overlay: &OverlayAddress) -> bool {
        self.table.read().peers.contains_key(overlay)
    }

    /// Overlays of the peers in bin `po`.
    pub fn bin(&self, po: u8) -> Vec<OverlayAddress> {
        self.table
            .read()
            .bins
            .get(po as usize)
            .map(|bin| bin.iter().map(|p| p.overlay).collect())
            .unwrap_or_default()
    }

    /// Get the total number of peers in the routing table.
    pub fn len(&self) -> usize {
        self.table.read().peers.len()
    }

    /// Check if the routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.read().peers.is_empty()
    }

    /// Get statistics about the routing table.
    pub fn stats(&self) -> KademliaStats {
        let table = self.table.read();
        KademliaStats {
            total_peers: table.peers.len(),
            depth: *self.depth.borrow(),
            bin_counts: table.bins.iter().map(Vec::len).collect(),
        }
    }

    fn update_depth(&self) {
        let counts: Vec<usize> = self.table.read().bins.iter().map(Vec::len).collect();
        let depth = compute_depth(&counts, self.config.min_neighbourhood_size);
        let changed = self.depth.send_if_modified(|current| {
            if *current != depth {
                *current = depth;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(depth, "Neighbourhood depth changed");
        }
    }
}

/// Deepest bin with at least `min_size` peers at or beyond it, capped at the
/// shallowest empty bin.
fn compute_depth(bin_counts: &[usize], min_size: usize) -> u8 {
    let shallowest_empty = bin_counts
        .iter()
        .position(|&c| c == 0)
        .unwrap_or(bin_counts.len()) as u8;

    let mut total = 0;
    let mut depth = 0u8;
    for (po, &count) in bin_counts.iter().enumerate().rev() {
        total += count;
        if total >= min_size {
            depth = po as u8;
            break;
        }
    }
    depth.min(shallowest_empty).min(MAX_PO)
}

impl Topology for Kademlia {
    fn base(&self) -> OverlayAddress {
        self.local
    }

    fn depth(&self) -> u8 {
        *self.depth.borrow()
    }

    fn subscribe_depth(&self) -> watch::Receiver<u8> {
        self.depth.subscribe()
    }

    fn peers_by_proximity(
        &self,
        target: &SwarmAddress,
        capability: Capability,
    ) -> Vec<ProximityBin> {
        let mut bins: Vec<ProximityBin> = (0..NUM_BINS as u8)
            .rev()
            .map(|po| ProximityBin {
                po,
                peers: Vec::new(),
            })
            .collect();

        for peer in self.table.read().bins.iter().flatten() {
            if !peer.has(capability) {
                continue;
            }
            let po = target.proximity(&peer.overlay);
            if let Some(bin) = bins.get_mut((MAX_PO - po) as usize) {
                bin.peers.push(peer.overlay);
            }
        }

        bins.retain(|b| !b.peers.is_empty());
        for bin in &mut bins {
            bin.peers.sort();
        }
        bins
    }

    fn has_capability(&self, peer: &OverlayAddress, capability: Capability) -> bool {
        self.get(peer).is_some_and(|p| p.has(capability))
    }
}

/// Statistics about the Kademlia routing table.
#[derive(Debug, Clone)]
pub struct KademliaStats {
    /// Total number of peers.
    pub total_peers: usize,

    /// Current depth.
    pub depth: u8,

    /// Peer count per bin.
    pub bin_counts: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay_at_po(po: u8, salt: u8) -> OverlayAddress {
        // local is all zeros, so the first set bit decides the PO
        let mut bytes = [0u8; 32];
        let po = po as usize;
        bytes[po / 8] = 0x80 >> (po % 8);
        bytes[31] = salt;
        OverlayAddress::new(bytes)
    }

    fn kad(min: usize) -> Kademlia {
        Kademlia::new(
            OverlayAddress::ZERO,
            KademliaConfig {
                min_neighbourhood_size: min,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_add_and_remove() {
        let kad = kad(2);
        let peer = KademliaPeer::full(overlay_at_po(0, 1));
        assert!(kad.add(peer.clone()));
        assert_eq!(kad.len(), 1);
        assert!(!kad.add(peer.clone()));
        assert_eq!(kad.remove(&peer.overlay), Some(peer));
        assert!(kad.is_empty());
    }

    #[test]
    fn test_dont_add_self() {
        let kad = kad(2);
        assert!(!kad.add(KademliaPeer::full(OverlayAddress::ZERO)));
        assert_eq!(kad.len(), 0);
    }

    #[test]
    fn test_compute_depth() {
        let mut counts = vec![0usize; NUM_BINS];
        assert_eq!(compute_depth(&counts, 2), 0);

        counts[0] = 1;
        counts[1] = 1;
        counts[2] = 1;
        counts[5] = 2;
        // two peers at po 5 but bin 3 is empty
        assert_eq!(compute_depth(&counts, 2), 3);
        counts[3] = 1;
        counts[4] = 1;
        assert_eq!(compute_depth(&counts, 2), 5);
        assert_eq!(compute_depth(&counts, 3), 4);
    }

    #[tokio::test]
    async fn test_depth_changes_are_published() {
        let kad = kad(1);
        let mut depth = kad.subscribe_depth();
        assert_eq!(*depth.borrow_and_update(), 0);

        kad.add(KademliaPeer::full(overlay_at_po(0, 1)));
        kad.add(KademliaPeer::full(overlay_at_po(1, 1)));
        assert!(depth.has_changed().unwrap());
        assert_eq!(*depth.borrow_and_update(), 1);

        kad.remove(&overlay_at_po(1, 1));
        assert_eq!(*depth.borrow_and_update(), 0);
    }

    #[test]
    fn test_peers_by_proximity() {
        let kad = kad(2);
        kad.add(KademliaPeer::full(overlay_at_po(0, 1)));
        kad.add(KademliaPeer::full(overlay_at_po(3, 2)));
        kad.add(KademliaPeer::full(overlay_at_po(3, 1)));
        kad.add(KademliaPeer::new(overlay_at_po(5, 1)).with_capability(Capability::PullSync));

        let bins = kad.peers_by_proximity(&OverlayAddress::ZERO, Capability::Retrieval);
        let pos: Vec<u8> = bins.iter().map(|b| b.po).collect();
        assert_eq!(pos, vec![3, 0]);
        assert_eq!(bins[0].peers, vec![overlay_at_po(3, 1), overlay_at_po(3, 2)]);

        assert!(kad.has_capability(&overlay_at_po(5, 1), Capability::PullSync));
        assert!(!kad.has_capability(&overlay_at_po(5, 1), Capability::Retrieval));
    }
}
