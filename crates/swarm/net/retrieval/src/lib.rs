//! Swarm retrieval.
//!
//! Request/response protocol that moves a chunk from wherever it is stored
//! to the node asking for it. Requests are forwarded hop by hop towards the
//! chunk's neighbourhood; deliveries travel back along the same path and
//! are cached in every store on the way.

mod config;
mod error;
mod messages;
mod metrics;
mod peer;
mod retrieval;

pub use config::{
    DEFAULT_FAILED_PEER_SKIP_TTL, DEFAULT_FETCHER_GLOBAL_TIMEOUT, DEFAULT_FIND_PEER_BACKOFF,
    DEFAULT_MAX_FIND_PEER_RETRIES, DEFAULT_MAX_HOP_COUNT, DEFAULT_SEARCH_TIMEOUT,
    DEFAULT_STOP_TIMEOUT, RetrievalConfig,
};
pub use error::{RetrievalError, RetrievalResult};
pub use messages::{ChunkDelivery, RetrievalMessage, RetrieveRequest};
pub use peer::{PendingRetrieval, RetrievalPeer, SkipSet};
pub use retrieval::{Request, Retrieval};
