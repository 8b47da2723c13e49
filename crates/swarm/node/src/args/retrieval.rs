//! Retrieval CLI arguments.

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use vertex_swarm_net_retrieval::{
    DEFAULT_FAILED_PEER_SKIP_TTL, DEFAULT_FETCHER_GLOBAL_TIMEOUT, DEFAULT_MAX_FIND_PEER_RETRIES,
    DEFAULT_MAX_HOP_COUNT, DEFAULT_SEARCH_TIMEOUT, RetrievalConfig,
};

const DEFAULT_SEARCH_TIMEOUT_MS: u64 = DEFAULT_SEARCH_TIMEOUT.as_millis() as u64;
const DEFAULT_GLOBAL_TIMEOUT_SECS: u64 = DEFAULT_FETCHER_GLOBAL_TIMEOUT.as_secs();
const DEFAULT_SKIP_TTL_SECS: u64 = DEFAULT_FAILED_PEER_SKIP_TTL.as_secs();

/// Retrieval configuration.
#[derive(Debug, Args, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[command(next_help_heading = "Retrieval")]
#[serde(default)]
pub struct RetrievalArgs {
    /// Milliseconds to wait for one peer before asking the next.
    #[arg(long = "retrieval.search-timeout", default_value_t = DEFAULT_SEARCH_TIMEOUT_MS, value_name = "MS")]
    pub search_timeout_ms: u64,

    /// Seconds a whole fetch may take across all peers.
    #[arg(long = "retrieval.global-timeout", default_value_t = DEFAULT_GLOBAL_TIMEOUT_SECS, value_name = "SECS")]
    pub global_timeout_secs: u64,

    /// Seconds a peer that failed a fetch is skipped.
    #[arg(long = "retrieval.skip-ttl", default_value_t = DEFAULT_SKIP_TTL_SECS, value_name = "SECS")]
    pub skip_ttl_secs: u64,

    /// Attempts at finding a connected peer before giving up.
    #[arg(long = "retrieval.find-peer-retries", default_value_t = DEFAULT_MAX_FIND_PEER_RETRIES)]
    pub max_find_peer_retries: usize,

    /// Hop count at which forwarded requests are refused.
    #[arg(long = "retrieval.max-hops", default_value_t = DEFAULT_MAX_HOP_COUNT)]
    pub max_hop_count: u8,
}

impl Default for RetrievalArgs {
    fn default() -> Self {
        Self {
            search_timeout_ms: DEFAULT_SEARCH_TIMEOUT_MS,
            global_timeout_secs: DEFAULT_GLOBAL_TIMEOUT_SECS,
            skip_ttl_secs: DEFAULT_SKIP_TTL_SECS,
            max_find_peer_retries: DEFAULT_MAX_FIND_PEER_RETRIES,
            max_hop_count: DEFAULT_MAX_HOP_COUNT,
        }
    }
}

impl RetrievalArgs {
    pub fn config(&self) -> RetrievalConfig {
        RetrievalConfig {
            search_timeout: Duration::from_millis(self.search_timeout_ms),
            global_timeout: Duration::from_secs(self.global_timeout_secs),
            failed_peer_skip_ttl: Duration::from_secs(self.skip_ttl_secs),
            max_find_peer_retries: self.max_find_peer_retries,
            max_hop_count: self.max_hop_count,
            ..Default::default()
        }
    }
}
