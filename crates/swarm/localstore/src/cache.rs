//! LRU cache of recently handled chunks.
//!
//! Sits in front of a [`ChunkStore`](crate::ChunkStore) on hot paths such as
//! answering "do we need this hash?" for every offered batch.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use hashlink::LruCache;
use parking_lot::Mutex;
use vertex_swarm_primitives::{Chunk, ChunkAddress};

pub struct ChunkCache {
    cache: Mutex<LruCache<ChunkAddress, Bytes>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ChunkCache {
    /// Create a new cache with the given capacity (at least one entry).
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity.max(1))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a chunk from the cache.
    pub fn get(&self, address: &ChunkAddress) -> Option<Chunk> {
        let mut cache = self.cache.lock();
        match cache.get(address) {
            Some(data) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Chunk::new(*address, data.clone()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Put a chunk into the cache.
    pub fn put(&self, chunk: &Chunk) {
        self.cache
            .lock()
            .insert(*chunk.address(), chunk.data().clone());
    }

    /// Check if a chunk is in the cache without touching its recency.
    pub fn contains(&self, address: &ChunkAddress) -> bool {
        self.cache.lock().contains_key(address)
    }

    pub fn remove(&self, address: &ChunkAddress) {
        self.cache.lock().remove(address);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let cache = self.cache.lock();

        CacheStats {
            capacity: cache.capacity(),
            size: cache.len(),
            hits,
            misses,
        }
    }
}

impl std::fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCache").field("stats", &self.stats()).finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Maximum cache capacity.
    pub capacity: usize,
    /// Current cache size.
    pub size: usize,
    /// Cache hits.
    pub hits: u64,
    /// Cache misses.
    pub misses: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(n: u8) -> Chunk {
        Chunk::from_data(vec![n; 8]).unwrap()
    }

    #[test]
    fn test_cache_put_get() {
        let cache = ChunkCache::new(10);
        let c = chunk(1);
        cache.put(&c);
        assert_eq!(cache.get(c.address()), Some(c));
    }

    #[test]
    fn test_cache_eviction() {
        let cache = ChunkCache::new(2);
        let (one, two, three) = (chunk(1), chunk(2), chunk(3));
        cache.put(&one);
        cache.put(&two);
        // touching `one` makes `two` the eviction candidate
        assert!(cache.get(one.address()).is_some());
        cache.put(&three);

        assert!(cache.contains(one.address()));
        assert!(!cache.contains(two.address()));
        assert!(cache.contains(three.address()));
    }

    #[test]
    fn test_cache_stats() {
        let cache = ChunkCache::new(10);
        let c = chunk(1);
        cache.put(&c);
        cache.get(c.address());
        cache.get(chunk(2).address());

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size, stats.capacity), (1, 1, 1, 10));
    }
}
