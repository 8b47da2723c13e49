//! Node metrics

use metrics::{Counter, Gauge};

#[derive(Clone, Debug)]
pub(crate) struct NodeMetrics {
    pub(crate) connected_peers: Gauge,
    /// Connections refused on connect
    pub(crate) refused_peers: Counter,
    /// Connections dropped for undecodable frames
    pub(crate) protocol_errors: Counter,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            connected_peers: metrics::gauge!("node.connected_peers"),
            refused_peers: metrics::counter!("node.refused_peers"),
            protocol_errors: metrics::counter!("node.protocol_errors"),
        }
    }
}
