//! Swarm pull-sync.
//!
//! Neighbouring nodes replicate chunks by pulling each other's per-bin pull
//! index. A node learns a peer's cursor per stream, fetches the history
//! below it in batches and follows the live head above it. Synced ranges
//! are recorded per peer and stream in a persistent interval set so that a
//! reconnect resumes where the last session stopped.
//!
//! The protocol core is the [`Registry`], generic over [`StreamProvider`]s.
//! The only provider shipped here is [`SyncProvider`], serving the `SYNC`
//! streams of a [`ChunkStore`](vertex_swarm_localstore::ChunkStore).

mod config;
mod error;
mod messages;
mod metrics;
mod peer;
mod provider;
mod registry;
mod sync_provider;

pub use config::{
    DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT, DEFAULT_CLIENT_BATCH_TIMEOUT, DEFAULT_MIN_FRAME,
    DEFAULT_STOP_TIMEOUT, DEFAULT_SYNC_INIT_BACKOFF, PullsyncConfig,
};
pub use error::{SyncError, SyncResult};
pub use messages::{
    ChunkDelivery, GetRange, OfferedHashes, StreamId, StreamInfo, StreamInfoReq, StreamInfoRes,
    StreamMessage, WantedHashes,
};
pub use peer::{Peer, Want};
pub use provider::StreamProvider;
pub use registry::Registry;
pub use sync_provider::{SYNC_STREAM_NAME, SyncProvider, sync_bins, sync_subscriptions_diff};
