//! In-memory chunk store.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::trace;
use vertex_swarm_primitives::{Chunk, ChunkAddress, Descriptor, NUM_BINS, OverlayAddress};

use crate::{ChunkStore, ModePut, PullSubscription, StoreError, StoreResult};

/// Descriptors read from the index per lock acquisition.
const PULL_BATCH: usize = 128;

/// Capacity of the descriptor channel handed to subscribers.
const PULL_BUFFER: usize = 64;

#[derive(Debug)]
struct StoredChunk {
    data: Bytes,
    /// `None` until the chunk is stored in a pull-indexed mode.
    bin_id: Option<u64>,
    synced: bool,
}

#[derive(Debug, Default)]
struct PullBin {
    index: BTreeMap<u64, ChunkAddress>,
    last: u64,
}

#[derive(Debug)]
struct State {
    chunks: HashMap<ChunkAddress, StoredChunk>,
    bins: Vec<PullBin>,
}

/// Volatile [`ChunkStore`] keyed by proximity to a base address.
///
/// Each bin has its own bin id counter starting at 1. Live subscribers are
/// woken through a per-bin watch channel carrying the latest bin id.
#[derive(Debug)]
pub struct MemoryChunkStore {
    base: OverlayAddress,
    state: Arc<RwLock<State>>,
    heads: Vec<watch::Sender<u64>>,
}

impl MemoryChunkStore {
    pub fn new(base: OverlayAddress) -> Self {
        Self {
            base,
            state: Arc::new(RwLock::new(State {
                chunks: HashMap::new(),
                bins: (0..NUM_BINS).map(|_| PullBin::default()).collect(),
            })),
            heads: (0..NUM_BINS).map(|_| watch::channel(0).0).collect(),
        }
    }

    pub fn base(&self) -> &OverlayAddress {
        &self.base
    }

    /// Pull-index bin of an address.
    pub fn bin_of(&self, address: &ChunkAddress) -> u8 {
        self.base.proximity(address)
    }

    pub fn len(&self) -> usize {
        self.state.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_synced(&self, address: &ChunkAddress) -> bool {
        self.state
            .read()
            .chunks
            .get(address)
            .is_some_and(|c| c.synced)
    }

    /// All addresses in the pull index of `bin`, in bin id order.
    pub fn pull_index(&self, bin: u8) -> Vec<ChunkAddress> {
        self.state
            .read()
            .bins
            .get(bin as usize)
            .map(|b| b.index.values().copied().collect())
            .unwrap_or_default()
    }
}

impl ChunkStore for MemoryChunkStore {
    fn put(&self, mode: ModePut, chunks: &[Chunk]) -> StoreResult<Vec<bool>> {
        for chunk in chunks {
            chunk.verify()?;
        }

        let mut seen = Vec::with_capacity(chunks.len());
        let mut state = self.state.write();
        for chunk in chunks {
            let address = *chunk.address();
            let existing = state.chunks.get(&address).map(|c| c.bin_id.is_some());
            seen.push(existing.is_some());

            let needs_index = mode.indexes_for_pull() && existing != Some(true);
            let bin_id = if needs_index {
                let bin = self.bin_of(&address);
                let pull_bin = state
                    .bins
                    .get_mut(bin as usize)
                    .ok_or(StoreError::InvalidBin(bin))?;
                pull_bin.last += 1;
                let id = pull_bin.last;
                pull_bin.index.insert(id, address);
                if let Some(head) = self.heads.get(bin as usize) {
                    head.send_replace(id);
                }
                trace!(%address, bin, bin_id = id, %mode, "Indexed chunk");
                Some(id)
            } else {
                None
            };

            match state.chunks.get_mut(&address) {
                Some(stored) => {
                    if bin_id.is_some() {
                        stored.bin_id = bin_id;
                    }
                }
                None => {
                    state.chunks.insert(
                        address,
                        StoredChunk {
                            data: chunk.data().clone(),
                            bin_id,
                            synced: false,
                        },
                    );
                }
            }
        }
        Ok(seen)
    }

    fn get(&self, address: &ChunkAddress) -> StoreResult<Chunk> {
        self.state
            .read()
            .chunks
            .get(address)
            .map(|c| Chunk::new(*address, c.data.clone()))
            .ok_or(StoreError::NotFound(*address))
    }

    fn has(&self, address: &ChunkAddress) -> StoreResult<bool> {
        Ok(self.state.read().chunks.contains_key(address))
    }

    fn set_synced(&self, addresses: &[ChunkAddress]) -> StoreResult<()> {
        let mut state = self.state.write();
        for address in addresses {
            if let Some(chunk) = state.chunks.get_mut(address) {
                chunk.synced = true;
            }
        }
        Ok(())
    }

    fn last_pull_bin_id(&self, bin: u8) -> StoreResult<u64> {
        self.state
            .read()
            .bins
            .get(bin as usize)
            .map(|b| b.last)
            .ok_or(StoreError::InvalidBin(bin))
    }

    fn subscribe_pull(
        &self,
        bin: u8,
        since: u64,
        until: Option<u64>,
    ) -> StoreResult<PullSubscription> {
        let mut head = self
            .heads
            .get(bin as usize)
            .ok_or(StoreError::InvalidBin(bin))?
            .subscribe();
        let (tx, rx) = mpsc::channel(PULL_BUFFER);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut next = since.max(1);
            let bounded = until.is_some();
            let until = until.unwrap_or(u64::MAX);

            loop {
                let last = *head.borrow_and_update();
                let batch: Vec<Descriptor> = state
                    .read()
                    .bins
                    .get(bin as usize)
                    .map(|b| {
                        b.index
                            .range(next..=until)
                            .take(PULL_BATCH)
                            .map(|(&bin_id, &address)| Descriptor { address, bin_id })
                            .collect()
                    })
                    .unwrap_or_default();
                let full = batch.len() == PULL_BATCH;

                for descriptor in batch {
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => return,
                        sent = tx.send(descriptor) => if sent.is_err() { return },
                    }
                    next = descriptor.bin_id.saturating_add(1);
                }

                if next > until || (bounded && !full && last >= until) {
                    return;
                }
                if full {
                    continue;
                }

                tokio::select! {
                    _ = stop_rx.changed() => return,
                    changed = head.changed() => if changed.is_err() { return },
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(PullSubscription::new(rx, stop_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    /// Deterministic chunks whose address falls in `bin` relative to `base`.
    fn chunks_in_bin(base: &OverlayAddress, bin: u8, count: usize) -> Vec<Chunk> {
        (0u64..)
            .filter_map(|i| Chunk::from_data(i.to_be_bytes().to_vec()).ok())
            .filter(|c| base.proximity(c.address()) == bin)
            .take(count)
            .collect()
    }

    #[test]
    fn test_put_reports_seen() {
        let store = MemoryChunkStore::new(OverlayAddress::ZERO);
        let chunks = chunks_in_bin(store.base(), 0, 3);

        assert_eq!(store.put(ModePut::Sync, &chunks).unwrap(), vec![false; 3]);
        assert_eq!(store.put(ModePut::Sync, &chunks[..1]).unwrap(), vec![true]);
        assert_eq!(store.len(), 3);
        assert_eq!(store.last_pull_bin_id(0).unwrap(), 3);
        assert_eq!(store.get(chunks[1].address()).unwrap(), chunks[1]);
    }

    #[test]
    fn test_invalid_chunk_rejects_batch() {
        let store = MemoryChunkStore::new(OverlayAddress::ZERO);
        let good = chunks_in_bin(store.base(), 0, 1).remove(0);
        let bad = Chunk::new(OverlayAddress::new([9; 32]), good.data().clone());

        let err = store.put(ModePut::Sync, &[good.clone(), bad]).unwrap_err();
        assert!(err.is_invalid_chunk());
        assert!(!store.has(good.address()).unwrap());
        assert_matches!(store.get(good.address()), Err(StoreError::NotFound(_)));
    }

    #[test]
    fn test_request_mode_is_not_pull_indexed() {
        let store = MemoryChunkStore::new(OverlayAddress::ZERO);
        let chunk = chunks_in_bin(store.base(), 1, 1).remove(0);

        store.put(ModePut::Request, std::slice::from_ref(&chunk)).unwrap();
        assert!(store.has(chunk.address()).unwrap());
        assert_eq!(store.last_pull_bin_id(1).unwrap(), 0);

        // a later sync put indexes it once
        store.put(ModePut::Sync, std::slice::from_ref(&chunk)).unwrap();
        store.put(ModePut::Sync, std::slice::from_ref(&chunk)).unwrap();
        assert_eq!(store.last_pull_bin_id(1).unwrap(), 1);
        assert_eq!(store.pull_index(1), vec![*chunk.address()]);
    }

    #[test]
    fn test_set_synced() {
        let store = MemoryChunkStore::new(OverlayAddress::ZERO);
        let chunk = chunks_in_bin(store.base(), 0, 1).remove(0);
        store.put(ModePut::Upload, std::slice::from_ref(&chunk)).unwrap();
        assert!(!store.is_synced(chunk.address()));
        store.set_synced(&[*chunk.address()]).unwrap();
        assert!(store.is_synced(chunk.address()));
    }

    #[tokio::test]
    async fn test_bounded_subscription_ends() {
        let store = MemoryChunkStore::new(OverlayAddress::ZERO);
        let chunks = chunks_in_bin(store.base(), 0, 5);
        store.put(ModePut::Sync, &chunks).unwrap();

        let mut sub = store.subscribe_pull(0, 2, Some(4)).unwrap();
        let mut ids = Vec::new();
        while let Some(d) = sub.recv().await {
            ids.push(d.bin_id);
        }
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_live_subscription_follows_puts() {
        let store = MemoryChunkStore::new(OverlayAddress::ZERO);
        let chunks = chunks_in_bin(store.base(), 0, 3);
        store.put(ModePut::Sync, &chunks[..1]).unwrap();

        let mut sub = store.subscribe_pull(0, 2, None).unwrap();
        store.put(ModePut::Sync, &chunks[1..]).unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((first.bin_id, second.bin_id), (2, 3));
        assert_eq!(first.address, *chunks[1].address());

        sub.stop();
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_invalid_bin() {
        let store = MemoryChunkStore::new(OverlayAddress::ZERO);
        assert_matches!(store.last_pull_bin_id(200), Err(StoreError::InvalidBin(200)));
    }
}
