use std::time::Duration;

/// Wait for a delivery from one peer before asking the next.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a whole fetch, across all peers tried.
pub const DEFAULT_FETCHER_GLOBAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a peer that failed a fetch is skipped.
pub const DEFAULT_FAILED_PEER_SKIP_TTL: Duration = Duration::from_secs(10);

/// Attempts at finding a connected peer before giving up.
pub const DEFAULT_MAX_FIND_PEER_RETRIES: usize = 5;

/// Requests that travelled this many hops are refused.
pub const DEFAULT_MAX_HOP_COUNT: u8 = 10;

/// First back-off between find-peer retries, doubled on each retry.
pub const DEFAULT_FIND_PEER_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound on how long [`Retrieval::stop`](crate::Retrieval::stop) waits.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Retrieval configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalConfig {
    pub search_timeout: Duration,
    pub global_timeout: Duration,
    pub failed_peer_skip_ttl: Duration,
    pub max_find_peer_retries: usize,
    pub max_hop_count: u8,
    pub find_peer_backoff: Duration,
    pub stop_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_timeout: DEFAULT_SEARCH_TIMEOUT,
            global_timeout: DEFAULT_FETCHER_GLOBAL_TIMEOUT,
            failed_peer_skip_ttl: DEFAULT_FAILED_PEER_SKIP_TTL,
            max_find_peer_retries: DEFAULT_MAX_FIND_PEER_RETRIES,
            max_hop_count: DEFAULT_MAX_HOP_COUNT,
            find_peer_backoff: DEFAULT_FIND_PEER_BACKOFF,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl RetrievalConfig {
    /// Back-off before find-peer retry number `retry` (1-based).
    pub fn retry_backoff(&self, retry: usize) -> Duration {
        let shift = retry.saturating_sub(1).min(16) as u32;
        self.find_peer_backoff.saturating_mul(1 << shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let config = RetrievalConfig::default();
        assert_eq!(config.retry_backoff(1), Duration::from_millis(10));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(20));
        assert_eq!(config.retry_backoff(4), Duration::from_millis(80));
    }
}
