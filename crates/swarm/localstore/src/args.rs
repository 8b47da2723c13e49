//! Local store CLI arguments.

use clap::Args;
use serde::{Deserialize, Serialize};

/// Default number of chunks kept in the hot cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Local store configuration arguments.
#[derive(Debug, Args, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[command(next_help_heading = "Local Store")]
#[serde(default)]
pub struct LocalStoreArgs {
    /// Cache capacity in number of chunks.
    #[arg(long = "localstore.cache-chunks", default_value_t = DEFAULT_CACHE_CAPACITY)]
    pub cache_chunks: usize,
}

impl LocalStoreArgs {
    pub fn cache(&self) -> crate::ChunkCache {
        crate::ChunkCache::new(self.cache_chunks)
    }
}

impl Default for LocalStoreArgs {
    fn default() -> Self {
        Self {
            cache_chunks: DEFAULT_CACHE_CAPACITY,
        }
    }
}
