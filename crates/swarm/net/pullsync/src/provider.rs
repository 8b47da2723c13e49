use std::sync::Arc;

use async_trait::async_trait;
use vertex_swarm_localstore::PullSubscription;
use vertex_swarm_primitives::{Chunk, ChunkAddress, OverlayAddress};

use crate::{Peer, StreamId, SyncResult};

/// A family of streams served and consumed over the stream protocol.
///
/// The registry looks providers up by [`name`](StreamProvider::name); the
/// key part of a [`StreamId`] is opaque to it and only interpreted here.
#[async_trait]
pub trait StreamProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn parse_key(&self, key: &str) -> SyncResult<u64>;

    fn encode_key(&self, key: u64) -> String;

    /// Latest index of the stream on this node.
    fn cursor(&self, key: u64) -> SyncResult<u64>;

    /// Descriptors of the stream in `[from, to]`, or from `from` onwards
    /// when `to` is `None`.
    fn subscribe(&self, key: u64, from: u64, to: Option<u64>) -> SyncResult<PullSubscription>;

    /// Whether this node is missing the chunk.
    fn need_data(&self, address: &ChunkAddress) -> SyncResult<bool>;

    fn get(&self, addresses: &[ChunkAddress]) -> SyncResult<Vec<Chunk>>;

    /// Stores delivered chunks, returning for each whether it was already
    /// present.
    fn put(&self, chunks: &[Chunk]) -> SyncResult<Vec<bool>>;

    /// Marks offered chunks as synced to the peer.
    fn set(&self, addresses: &[ChunkAddress]) -> SyncResult<()>;

    /// Whether we currently want to sync `stream` from `peer`.
    fn want_stream(&self, peer: &OverlayAddress, stream: &StreamId) -> bool;

    fn autostart(&self) -> bool;

    fn bounded(&self) -> bool;

    /// Per-peer task started when the peer connects. Runs until the peer or
    /// the registry quits.
    async fn init_peer(&self, _peer: Arc<Peer>) -> SyncResult<()> {
        Ok(())
    }

    /// Called once when the registry stops.
    fn close(&self) {}
}
