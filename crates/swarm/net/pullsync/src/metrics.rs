//! Pull-sync metrics

use metrics::{Counter, Gauge};

#[derive(Clone, Debug)]
pub(crate) struct PullsyncMetrics {
    /// Connected peers with a stream session
    pub(crate) peers: Gauge,
    /// Non-empty offers sent
    pub(crate) offered_hashes: Counter,
    /// Empty offers sent for historical ranges without descriptors
    pub(crate) empty_offered_hashes: Counter,
    /// Non-empty wanted bitvectors sent
    pub(crate) wanted_hashes: Counter,
    /// Offers answered with an empty bitvector
    pub(crate) empty_wanted_hashes: Counter,
    /// Delivered chunks we already had
    pub(crate) seen_chunk_delivery: Counter,
    /// Chunks received through the stream protocol
    pub(crate) chunks_received: Counter,
    /// Chunks sent through the stream protocol
    pub(crate) chunks_sent: Counter,
    /// Intervals sealed
    pub(crate) sealed_intervals: Counter,
    /// Wanted batches not delivered in time
    pub(crate) batch_timeout: Counter,
    /// Server batches closed because they reached the batch size
    pub(crate) collect_batch_full: Counter,
    /// Server batches closed by the inter-descriptor timer
    pub(crate) collect_batch_timer: Counter,
    /// Batches finished after the stream stopped being wanted
    pub(crate) quit_unwanted: Counter,
    /// Peers disconnected for a protocol violation
    pub(crate) dropped_peers: Counter,
}

impl Default for PullsyncMetrics {
    fn default() -> Self {
        Self {
            peers: metrics::gauge!("pullsync.peers"),
            offered_hashes: metrics::counter!("pullsync.offered_hashes"),
            empty_offered_hashes: metrics::counter!("pullsync.empty_offered_hashes"),
            wanted_hashes: metrics::counter!("pullsync.wanted_hashes"),
            empty_wanted_hashes: metrics::counter!("pullsync.empty_wanted_hashes"),
            seen_chunk_delivery: metrics::counter!("pullsync.seen_chunk_delivery"),
            chunks_received: metrics::counter!("pullsync.chunks_received"),
            chunks_sent: metrics::counter!("pullsync.chunks_sent"),
            sealed_intervals: metrics::counter!("pullsync.sealed_intervals"),
            batch_timeout: metrics::counter!("pullsync.batch_timeout"),
            collect_batch_full: metrics::counter!("pullsync.collect_batch.full"),
            collect_batch_timer: metrics::counter!("pullsync.collect_batch.timer_expire"),
            quit_unwanted: metrics::counter!("pullsync.quit_unwanted"),
            dropped_peers: metrics::counter!("pullsync.dropped_peers"),
        }
    }
}
