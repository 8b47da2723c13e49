//! Overlay topology as seen by the sync and retrieval protocols.
//!
//! The protocols only need a narrow view of the routing table: our base
//! address, neighbourhood depth (and its changes), and the connected peers
//! ordered by proximity to some target. [`Topology`] is that view,
//! [`Kademlia`] the in-memory table implementing it, and [`LoadBalancer`]
//! spreads requests across peers of equal proximity.

mod balancer;
pub mod kademlia;

pub use balancer::LoadBalancer;
pub use kademlia::{Kademlia, KademliaConfig, KademliaPeer, KademliaStats};

use std::collections::HashSet;

use tokio::sync::watch;
use vertex_swarm_primitives::{OverlayAddress, SwarmAddress};

/// Protocols a connected peer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Capability {
    PullSync,
    Retrieval,
}

/// Set of [`Capability`] flags.
pub type Capabilities = HashSet<Capability>;

/// Connected peers sharing one proximity order to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityBin {
    pub po: u8,
    pub peers: Vec<OverlayAddress>,
}

/// Read view of the overlay consumed by the protocols.
#[auto_impl::auto_impl(&, Arc)]
pub trait Topology: Send + Sync {
    /// Our own overlay address.
    fn base(&self) -> OverlayAddress;

    /// Current neighbourhood depth.
    fn depth(&self) -> u8;

    /// Receiver that observes every depth change.
    fn subscribe_depth(&self) -> watch::Receiver<u8>;

    /// Connected peers with `capability`, grouped by proximity to `target`,
    /// deepest bin first.
    fn peers_by_proximity(&self, target: &SwarmAddress, capability: Capability)
    -> Vec<ProximityBin>;

    /// Whether `peer` is connected and advertises `capability`.
    fn has_capability(&self, peer: &OverlayAddress, capability: Capability) -> bool;

    /// Proximity of `peer` to our base address.
    fn proximity(&self, peer: &OverlayAddress) -> u8 {
        self.base().proximity(peer)
    }
}
