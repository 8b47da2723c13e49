//! Per-peer retrieval session and the bookkeeping of a single fetch.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{trace, warn};
use vertex_net_codec::PeerSink;
use vertex_swarm_primitives::{ChunkAddress, OverlayAddress};

use crate::{RetrievalError, RetrievalMessage, RetrievalResult};

/// Retrieval session with one connected peer: the requests we sent it that
/// are still waiting for a delivery.
pub struct RetrievalPeer {
    overlay: OverlayAddress,
    sink: Arc<dyn PeerSink<RetrievalMessage>>,
    retrievals: Mutex<HashMap<u32, ChunkAddress>>,
}

impl std::fmt::Debug for RetrievalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalPeer")
            .field("overlay", &self.overlay)
            .field("retrievals", &self.retrievals.lock().len())
            .finish_non_exhaustive()
    }
}

impl RetrievalPeer {
    pub fn new(overlay: OverlayAddress, sink: Arc<dyn PeerSink<RetrievalMessage>>) -> Self {
        Self {
            overlay,
            sink,
            retrievals: Mutex::new(HashMap::new()),
        }
    }

    pub fn overlay(&self) -> &OverlayAddress {
        &self.overlay
    }

    pub async fn send(&self, msg: impl Into<RetrievalMessage>) -> RetrievalResult<()> {
        Ok(self.sink.send(msg.into()).await?)
    }

    /// Records an outstanding request. Returns a fresh ruid.
    pub(crate) fn add_retrieval(&self, address: ChunkAddress) -> u32 {
        let mut retrievals = self.retrievals.lock();
        loop {
            let ruid = rand::random::<u32>();
            if let std::collections::hash_map::Entry::Vacant(entry) = retrievals.entry(ruid) {
                entry.insert(address);
                return ruid;
            }
        }
    }

    /// Consumes the record of `ruid` if it was a request for `address`.
    pub fn check_retrieval(&self, ruid: u32, address: &ChunkAddress) -> RetrievalResult<()> {
        let mut retrievals = self.retrievals.lock();
        match retrievals.get(&ruid) {
            Some(expected) if expected == address => {
                retrievals.remove(&ruid);
                Ok(())
            }
            _ => Err(RetrievalError::Unsolicited {
                ruid,
                address: *address,
            }),
        }
    }

    pub(crate) fn expire_retrieval(&self, ruid: u32) {
        if self.retrievals.lock().remove(&ruid).is_some() {
            trace!(peer = %self.overlay, ruid, "Expired retrieval");
        }
    }

    pub fn retrievals_len(&self) -> usize {
        self.retrievals.lock().len()
    }

    pub(crate) fn disconnect(&self, reason: &str) {
        warn!(peer = %self.overlay, reason, "Dropping peer");
        self.retrievals.lock().clear();
        self.sink.disconnect(reason);
    }
}

/// Outstanding request returned by
/// [`Retrieval::request_from_peers`](crate::Retrieval::request_from_peers).
/// Dropping it expires the request record, so a late delivery is treated as
/// unsolicited.
#[must_use = "dropping the handle expires the request"]
#[derive(Debug)]
pub struct PendingRetrieval {
    peer: Arc<RetrievalPeer>,
    ruid: u32,
}

impl PendingRetrieval {
    pub(crate) fn new(peer: Arc<RetrievalPeer>, ruid: u32) -> Self {
        Self { peer, ruid }
    }

    pub fn peer(&self) -> &OverlayAddress {
        self.peer.overlay()
    }

    pub fn ruid(&self) -> u32 {
        self.ruid
    }
}

impl Drop for PendingRetrieval {
    fn drop(&mut self) {
        self.peer.expire_retrieval(self.ruid);
    }
}

/// Peers not to ask again during one fetch. Entries expire after a TTL.
#[derive(Debug, Clone)]
pub struct SkipSet {
    ttl: Duration,
    peers: HashMap<OverlayAddress, Instant>,
}

impl SkipSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            peers: HashMap::new(),
        }
    }

    pub fn insert(&mut self, peer: OverlayAddress) {
        self.peers.insert(peer, Instant::now());
    }

    pub fn contains(&self, peer: &OverlayAddress) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|since| since.elapsed() < self.ttl)
    }

    /// Number of peers currently skipped.
    pub fn len(&self) -> usize {
        self.peers
            .values()
            .filter(|since| since.elapsed() < self.ttl)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use vertex_net_codec::SendError;

    struct NullSink;

    #[async_trait]
    impl PeerSink<RetrievalMessage> for NullSink {
        async fn send(&self, _msg: RetrievalMessage) -> Result<(), SendError> {
            Ok(())
        }

        fn disconnect(&self, _reason: &str) {}
    }

    fn peer() -> Arc<RetrievalPeer> {
        Arc::new(RetrievalPeer::new(OverlayAddress::new([1; 32]), Arc::new(NullSink)))
    }

    #[test]
    fn test_check_retrieval_consumes_record() {
        let peer = peer();
        let address = ChunkAddress::new([7; 32]);
        let ruid = peer.add_retrieval(address);

        assert_matches!(
            peer.check_retrieval(ruid, &ChunkAddress::new([8; 32])),
            Err(RetrievalError::Unsolicited { .. })
        );
        peer.check_retrieval(ruid, &address).unwrap();
        assert_matches!(
            peer.check_retrieval(ruid, &address),
            Err(RetrievalError::Unsolicited { .. })
        );
    }

    #[test]
    fn test_pending_expires_on_drop() {
        let peer = peer();
        let ruid = peer.add_retrieval(ChunkAddress::new([7; 32]));
        let pending = PendingRetrieval::new(peer.clone(), ruid);
        assert_eq!(peer.retrievals_len(), 1);
        drop(pending);
        assert_eq!(peer.retrievals_len(), 0);
    }

    #[test]
    fn test_skip_set_expires() {
        let mut skip = SkipSet::new(Duration::ZERO);
        let peer = OverlayAddress::new([1; 32]);
        skip.insert(peer);
        assert!(!skip.contains(&peer));

        let mut skip = SkipSet::new(Duration::from_secs(60));
        skip.insert(peer);
        assert!(skip.contains(&peer));
        assert_eq!(skip.len(), 1);
    }
}
