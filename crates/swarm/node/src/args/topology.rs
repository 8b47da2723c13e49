//! Overlay topology CLI arguments.

use clap::Args;
use serde::{Deserialize, Serialize};
use vertex_swarm_topology::KademliaConfig;

/// Default number of peers required at or beyond depth.
const DEFAULT_NEIGHBOURHOOD_SIZE: usize = 2;

/// Default maximum peers per bin.
const DEFAULT_MAX_BIN_SIZE: usize = 16;

/// Routing table configuration.
#[derive(Debug, Args, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[command(next_help_heading = "Topology")]
#[serde(default)]
pub struct TopologyArgs {
    /// Overlay address of this node in hex. Random when unset.
    #[arg(long = "topology.overlay", value_name = "HEX")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<String>,

    /// Peers required at or beyond the neighbourhood depth.
    #[arg(long = "topology.neighbourhood-size", default_value_t = DEFAULT_NEIGHBOURHOOD_SIZE)]
    pub neighbourhood_size: usize,

    /// Maximum connected peers per proximity bin.
    #[arg(long = "topology.max-bin-size", default_value_t = DEFAULT_MAX_BIN_SIZE)]
    pub max_bin_size: usize,
}

impl Default for TopologyArgs {
    fn default() -> Self {
        Self {
            overlay: None,
            neighbourhood_size: DEFAULT_NEIGHBOURHOOD_SIZE,
            max_bin_size: DEFAULT_MAX_BIN_SIZE,
        }
    }
}

impl TopologyArgs {
    pub fn config(&self) -> KademliaConfig {
        KademliaConfig {
            min_neighbourhood_size: self.neighbourhood_size,
            max_bin_size: self.max_bin_size,
        }
    }
}
