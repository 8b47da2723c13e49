//! The `SYNC` stream family: one stream per pull-index bin.
//!
//! Which bins we sync from a peer depends on its proximity `po` to us and
//! our neighbourhood depth `d`:
//!
//! - a peer outside the neighbourhood (`po < d`) serves only its own bin,
//! - a neighbour (`po >= d`) serves every bin from `d` to [`MAX_PO`],
//! - with `within_depth_only`, peers outside the neighbourhood serve nothing.
//!
//! On every depth change the per-peer task subscribes to the bins that
//! became relevant and drops the cursors and wants of those that did not.

use std::{ops::RangeInclusive, sync::Arc};

use async_trait::async_trait;
use tracing::debug;
use vertex_swarm_localstore::{ChunkCache, ChunkStore, ModePut, PullSubscription};
use vertex_swarm_primitives::{Chunk, ChunkAddress, MAX_PO, OverlayAddress};
use vertex_swarm_topology::Topology;
use vertex_tasks::Shutdown;

use crate::{
    Peer, PullsyncConfig, StreamId, StreamInfoReq, StreamProvider, SyncError, SyncResult,
};

/// Provider name of the sync streams.
pub const SYNC_STREAM_NAME: &str = "SYNC";

/// Bins to sync from a peer at proximity `po` when our depth is `depth`.
pub fn sync_bins(
    po: u8,
    depth: u8,
    max_po: u8,
    within_depth_only: bool,
) -> Option<RangeInclusive<u8>> {
    let depth = depth.min(max_po);
    if po < depth {
        if within_depth_only {
            return None;
        }
        return Some(po..=po);
    }
    Some(depth..=max_po)
}

/// Bins to subscribe to and to quit when depth moves from `prev` to `new`.
/// `prev = None` means no subscriptions exist yet.
pub fn sync_subscriptions_diff(
    po: u8,
    prev: Option<u8>,
    new: u8,
    max_po: u8,
    within_depth_only: bool,
) -> (Vec<u8>, Vec<u8>) {
    let prev = prev.and_then(|d| sync_bins(po, d, max_po, within_depth_only));
    let new = sync_bins(po, new, max_po, within_depth_only);
    let contains = |range: &Option<RangeInclusive<u8>>, bin: &u8| {
        range.as_ref().is_some_and(|r| r.contains(bin))
    };

    let sub = new
        .clone()
        .into_iter()
        .flatten()
        .filter(|bin| !contains(&prev, bin))
        .collect();
    let quit = prev
        .clone()
        .into_iter()
        .flatten()
        .filter(|bin| !contains(&new, bin))
        .collect();
    (sub, quit)
}

/// Serves and consumes the per-bin pull index of a [`ChunkStore`].
pub struct SyncProvider<S, T> {
    store: S,
    topology: T,
    cache: ChunkCache,
    config: PullsyncConfig,
    quit: Shutdown,
}

impl<S, T> std::fmt::Debug for SyncProvider<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: ChunkStore, T: Topology> SyncProvider<S, T> {
    pub fn new(store: S, topology: T, cache: ChunkCache, config: PullsyncConfig) -> Self {
        Self {
            store,
            topology,
            cache,
            config,
            quit: Shutdown::new(),
        }
    }

    pub fn stream(&self, bin: u8) -> StreamId {
        StreamId::new(SYNC_STREAM_NAME, bin.to_string())
    }

    fn bin(&self, key: u64) -> SyncResult<u8> {
        u8::try_from(key)
            .ok()
            .filter(|bin| *bin <= MAX_PO)
            .ok_or_else(|| SyncError::InvalidKey(key.to_string()))
    }

    async fn update_subscriptions(&self, peer: &Peer, sub: Vec<u8>, quit: Vec<u8>) -> SyncResult<()> {
        debug!(peer = %peer.overlay(), ?sub, ?quit, "Updating sync subscriptions");
        if !sub.is_empty() {
            let streams = sub.into_iter().map(|bin| self.stream(bin)).collect();
            peer.send(StreamInfoReq { streams }).await?;
        }
        for bin in quit {
            let stream = self.stream(bin);
            peer.delete_cursor(&stream);
            peer.close_wants(&stream);
        }
        Ok(())
    }
}

#[async_trait]
impl<S, T> StreamProvider for SyncProvider<S, T>
where
    S: ChunkStore + 'static,
    T: Topology + 'static,
{
    fn name(&self) -> &str {
        SYNC_STREAM_NAME
    }

    fn parse_key(&self, key: &str) -> SyncResult<u64> {
        let bin = key
            .parse::<u64>()
            .map_err(|_| SyncError::InvalidKey(key.to_owned()))?;
        self.bin(bin).map(u64::from)
    }

    fn encode_key(&self, key: u64) -> String {
        key.to_string()
    }

    fn cursor(&self, key: u64) -> SyncResult<u64> {
        Ok(self.store.last_pull_bin_id(self.bin(key)?)?)
    }

    fn subscribe(&self, key: u64, from: u64, to: Option<u64>) -> SyncResult<PullSubscription> {
        Ok(self.store.subscribe_pull(self.bin(key)?, from, to)?)
    }

    fn need_data(&self, address: &ChunkAddress) -> SyncResult<bool> {
        if self.quit.is_signalled() || self.cache.contains(address) {
            return Ok(false);
        }
        Ok(!self.store.has(address)?)
    }

    fn get(&self, addresses: &[ChunkAddress]) -> SyncResult<Vec<Chunk>> {
        addresses
            .iter()
            .map(|address| match self.cache.get(address) {
                Some(chunk) => Ok(chunk),
                None => {
                    let chunk = self.store.get(address)?;
                    self.cache.put(&chunk);
                    Ok(chunk)
                }
            })
            .collect()
    }

    fn put(&self, chunks: &[Chunk]) -> SyncResult<Vec<bool>> {
        let seen = self.store.put(ModePut::Sync, chunks)?;
        for chunk in chunks {
            self.cache.put(chunk);
        }
        Ok(seen)
    }

    fn set(&self, addresses: &[ChunkAddress]) -> SyncResult<()> {
        Ok(self.store.set_synced(addresses)?)
    }

    fn want_stream(&self, peer: &OverlayAddress, stream: &StreamId) -> bool {
        if stream.name != SYNC_STREAM_NAME {
            return false;
        }
        let Ok(key) = self.parse_key(&stream.key) else {
            return false;
        };
        let po = self.topology.proximity(peer);
        sync_bins(po, self.topology.depth(), MAX_PO, self.config.within_depth_only)
            .is_some_and(|bins| bins.contains(&(key as u8)))
    }

    fn autostart(&self) -> bool {
        self.config.autostart
    }

    fn bounded(&self) -> bool {
        false
    }

    async fn init_peer(&self, peer: Arc<Peer>) -> SyncResult<()> {
        let quit = self.quit.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.config.sync_init_backoff) => {}
            _ = peer.closed() => return Ok(()),
            _ = quit.wait() => return Ok(()),
        }

        let po = self.topology.proximity(peer.overlay());
        let mut depth_rx = self.topology.subscribe_depth();
        let mut depth = *depth_rx.borrow_and_update();
        let within = self.config.within_depth_only;

        debug!(peer = %peer.overlay(), po, depth, "Initial sync subscriptions");
        let (sub, quit_bins) = sync_subscriptions_diff(po, None, depth, MAX_PO, within);
        self.update_subscriptions(&peer, sub, quit_bins).await?;

        loop {
            tokio::select! {
                changed = depth_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let new = *depth_rx.borrow_and_update();
                    if new == depth {
                        continue;
                    }
                    let (sub, quit_bins) = sync_subscriptions_diff(po, Some(depth), new, MAX_PO, within);
                    debug!(peer = %peer.overlay(), po, depth, new, "Depth changed");
                    self.update_subscriptions(&peer, sub, quit_bins).await?;
                    depth = new;
                }
                _ = peer.closed() => return Ok(()),
                _ = quit.wait() => return Ok(()),
            }
        }
    }

    fn close(&self) {
        self.quit.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vertex_swarm_localstore::MemoryChunkStore;
    use vertex_swarm_topology::{Kademlia, KademliaConfig};

    fn bins(range: RangeInclusive<u8>) -> Vec<u8> {
        range.collect()
    }

    #[test]
    fn test_within_depth_peer_leaves_neighbourhood() {
        let (sub, quit) = sync_subscriptions_diff(9, Some(8), 10, 16, true);
        assert!(sub.is_empty());
        assert_eq!(quit, bins(8..=16));
    }

    #[test]
    fn test_all_bins_depth_drops_to_zero() {
        let (sub, quit) = sync_subscriptions_diff(4, Some(5), 0, 16, false);
        let mut expected = bins(0..=3);
        expected.extend(5..=16);
        assert_eq!(sub, expected);
        assert!(quit.is_empty());
    }

    #[test]
    fn test_initial_subscriptions() {
        assert_eq!(sync_subscriptions_diff(0, None, 0, 16, false), (bins(0..=16), vec![]));
        assert_eq!(sync_subscriptions_diff(3, None, 5, 16, false), (vec![3], vec![]));
        assert_eq!(sync_subscriptions_diff(3, None, 5, 16, true), (vec![], vec![]));
        assert_eq!(sync_subscriptions_diff(7, None, 5, 16, true), (bins(5..=16), vec![]));
    }

    #[test]
    fn test_diff_properties() {
        for po in 0..=16u8 {
            for prev in 0..=16u8 {
                for new in 0..=16u8 {
                    for within in [false, true] {
                        let (sub, quit) = sync_subscriptions_diff(po, Some(prev), new, 16, within);
                        let prev_set: Vec<u8> =
                            sync_bins(po, prev, 16, within).into_iter().flatten().collect();
                        let new_set: Vec<u8> =
                            sync_bins(po, new, 16, within).into_iter().flatten().collect();

                        let mut result: Vec<u8> = prev_set
                            .iter()
                            .chain(&sub)
                            .filter(|b| !quit.contains(b))
                            .copied()
                            .collect();
                        result.sort_unstable();
                        result.dedup();
                        assert_eq!(result, new_set, "po={po} prev={prev} new={new}");
                        assert!(sub.iter().all(|b| !quit.contains(b)));
                        assert!(sub.iter().chain(&quit).all(|b| *b <= 16));
                    }
                }
            }
        }
    }

    #[test]
    fn test_keys() {
        let base = OverlayAddress::ZERO;
        let provider = SyncProvider::new(
            Arc::new(MemoryChunkStore::new(base)),
            Arc::new(Kademlia::new(base, KademliaConfig::default())),
            ChunkCache::new(16),
            PullsyncConfig::default(),
        );
        assert_eq!(provider.parse_key("16").unwrap(), 16);
        assert!(matches!(provider.parse_key("17"), Err(SyncError::InvalidKey(_))));
        assert!(matches!(provider.parse_key("x"), Err(SyncError::InvalidKey(_))));
        assert_eq!(provider.stream(3), StreamId::new("SYNC", "3"));
        assert!(!provider.want_stream(&base, &StreamId::new("OTHER", "0")));
    }

    #[test]
    fn test_need_data_uses_cache_and_store() {
        let base = OverlayAddress::ZERO;
        let store = Arc::new(MemoryChunkStore::new(base));
        let provider = SyncProvider::new(
            store.clone(),
            Arc::new(Kademlia::new(base, KademliaConfig::default())),
            ChunkCache::new(16),
            PullsyncConfig::default(),
        );
        let chunk = Chunk::from_data(b"need".to_vec()).unwrap();
        assert!(provider.need_data(chunk.address()).unwrap());

        assert_eq!(provider.put(std::slice::from_ref(&chunk)).unwrap(), vec![false]);
        assert!(!provider.need_data(chunk.address()).unwrap());
        assert_eq!(provider.get(&[*chunk.address()]).unwrap(), vec![chunk.clone()]);

        provider.set(&[*chunk.address()]).unwrap();
        assert!(store.is_synced(chunk.address()));
    }
}
