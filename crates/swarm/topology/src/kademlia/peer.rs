//! Peer representation in the Kademlia routing table.

use vertex_swarm_primitives::OverlayAddress;

use crate::{Capabilities, Capability};

/// A connected peer in the Kademlia routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KademliaPeer {
    /// The peer's overlay address (determines position in the table).
    pub overlay: OverlayAddress,

    /// Protocols the peer advertised on connect.
    pub capabilities: Capabilities,
}

impl KademliaPeer {
    /// Create a peer with no capabilities.
    pub fn new(overlay: OverlayAddress) -> Self {
        Self {
            overlay,
            capabilities: Capabilities::new(),
        }
    }

    /// Create a peer speaking both sync and retrieval.
    pub fn full(overlay: OverlayAddress) -> Self {
        Self::new(overlay)
            .with_capability(Capability::PullSync)
            .with_capability(Capability::Retrieval)
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
