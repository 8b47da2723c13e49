use vertex_swarm_primitives::OverlayAddress;

/// Reasons a connection is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    #[error("refusing connection to our own overlay")]
    SelfConnection,

    #[error("bin {po} is full, refusing peer {peer}")]
    BinFull { peer: OverlayAddress, po: u8 },

    #[error("node is stopped")]
    Stopped,
}
