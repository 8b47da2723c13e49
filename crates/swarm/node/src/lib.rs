//! Swarm node.
//!
//! [`Node`] owns the pieces a connected Swarm node runs: the Kademlia
//! routing table, the local chunk store, the pull-sync [`Registry`] and
//! [`Retrieval`]. The transport hands it connection events and decoded
//! [`Message`]s; the node keeps the routing table in step with the
//! connections and routes each message to its protocol.
//!
//! Settings come from [`NodeArgs`], either as CLI flags or from TOML.
//!
//! [`Registry`]: vertex_swarm_net_pullsync::Registry
//! [`Retrieval`]: vertex_swarm_net_retrieval::Retrieval

mod args;
mod error;
pub mod logging;
mod message;
mod metrics;
mod node;
mod sink;

pub use args::{LogArgs, NodeArgs, PullsyncArgs, RetrievalArgs, STATE_DB_FILE, TopologyArgs};
pub use error::NodeError;
pub use logging::init_logging;
pub use message::Message;
pub use node::{Node, NodeConfig, NodeRetrieval};
