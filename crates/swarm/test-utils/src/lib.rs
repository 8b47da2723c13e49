//! Test support for multi-node Swarm scenarios.
//!
//! [`MemoryNetwork`] connects [`Node`](vertex_swarm_node::Node)s through
//! in-process pipes carrying real wire frames. [`RawPeer`] stands in for a
//! misbehaving remote when a test needs to script the other side.

mod fixtures;
mod network;

pub use fixtures::{
    address_at_po, eventually, init_tracing, poll_until, random_chunk, random_chunks, test_config,
};
pub use network::{FrameSink, MemoryNetwork, RawPeer, full_capabilities};
