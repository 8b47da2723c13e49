//! Local chunk storage.
//!
//! [`ChunkStore`] is the interface the sync and retrieval protocols consume:
//! content-addressed put/get, a per-bin pull index with monotonically
//! increasing bin ids, and subscriptions over that index.
//! [`MemoryChunkStore`] is the in-process implementation.

mod args;
mod cache;
mod error;
mod memory;
mod subscription;

pub use args::{DEFAULT_CACHE_CAPACITY, LocalStoreArgs};
pub use cache::{CacheStats, ChunkCache};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryChunkStore;
pub use subscription::PullSubscription;

use vertex_swarm_primitives::{Chunk, ChunkAddress};

/// How a chunk entered the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ModePut {
    /// Uploaded locally.
    Upload,
    /// Received through pull-sync or as a retrieval hop inside our
    /// neighbourhood. Indexed for pull subscriptions.
    Sync,
    /// Received as a retrieval response outside our neighbourhood. Kept for
    /// serving but not offered to syncing peers.
    Request,
}

impl ModePut {
    /// Whether chunks stored in this mode get a pull-index bin id.
    pub fn indexes_for_pull(self) -> bool {
        !matches!(self, Self::Request)
    }
}

/// Chunk storage consumed by the network protocols.
#[auto_impl::auto_impl(&, Arc)]
pub trait ChunkStore: Send + Sync {
    /// Stores chunks after validating them. Returns, per chunk, whether it
    /// was already present. A single invalid chunk rejects the whole call.
    fn put(&self, mode: ModePut, chunks: &[Chunk]) -> StoreResult<Vec<bool>>;

    fn get(&self, address: &ChunkAddress) -> StoreResult<Chunk>;

    /// Fetches all `addresses`; fails if any is missing.
    fn get_multi(&self, addresses: &[ChunkAddress]) -> StoreResult<Vec<Chunk>> {
        addresses.iter().map(|a| self.get(a)).collect()
    }

    fn has(&self, address: &ChunkAddress) -> StoreResult<bool>;

    fn has_multi(&self, addresses: &[ChunkAddress]) -> StoreResult<Vec<bool>> {
        addresses.iter().map(|a| self.has(a)).collect()
    }

    /// Marks chunks as synced to a neighbour.
    fn set_synced(&self, addresses: &[ChunkAddress]) -> StoreResult<()>;

    /// Highest bin id assigned in `bin`, `0` if the bin is empty.
    fn last_pull_bin_id(&self, bin: u8) -> StoreResult<u64>;

    /// Streams descriptors of `bin` with bin ids in `[since, until]`.
    ///
    /// With `until = None` the subscription stays open and yields new
    /// chunks as they are stored. Must be called from within a tokio
    /// runtime.
    fn subscribe_pull(
        &self,
        bin: u8,
        since: u64,
        until: Option<u64>,
    ) -> StoreResult<PullSubscription>;
}
