//! Retrieval metrics

use metrics::{Counter, Gauge};

#[derive(Clone, Debug)]
pub(crate) struct RetrievalMetrics {
    pub(crate) peers: Gauge,
    /// Requests sent to peers
    pub(crate) request_from_peers: Counter,
    /// Peers that did not deliver within the search timeout
    pub(crate) search_timeout: Counter,
    /// Fetches that ran out of time
    pub(crate) fetch_timeout: Counter,
    /// Inbound requests handled
    pub(crate) handle_retrieve_request: Counter,
    /// Inbound requests we could not serve
    pub(crate) retrieve_chunk_fail: Counter,
    /// Inbound requests refused for their hop count
    pub(crate) hop_limit: Counter,
    /// Deliveries accepted
    pub(crate) chunk_delivery: Counter,
    /// Deliveries without a matching request
    pub(crate) unsolicited_delivery: Counter,
    /// Fetches that joined an existing flight
    pub(crate) singleflight_join: Counter,
}

impl Default for RetrievalMetrics {
    fn default() -> Self {
        Self {
            peers: metrics::gauge!("retrieval.peers"),
            request_from_peers: metrics::counter!("retrieval.request_from_peers"),
            search_timeout: metrics::counter!("retrieval.search_timeout"),
            fetch_timeout: metrics::counter!("retrieval.fetch_timeout"),
            handle_retrieve_request: metrics::counter!("retrieval.handle_retrieve_request"),
            retrieve_chunk_fail: metrics::counter!("retrieval.retrieve_chunk_fail"),
            hop_limit: metrics::counter!("retrieval.hop_limit"),
            chunk_delivery: metrics::counter!("retrieval.chunk_delivery"),
            unsolicited_delivery: metrics::counter!("retrieval.unsolicited_delivery"),
            singleflight_join: metrics::counter!("retrieval.singleflight_join"),
        }
    }
}
