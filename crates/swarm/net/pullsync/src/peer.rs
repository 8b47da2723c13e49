//! Per-peer stream session.
//!
//! A [`Peer`] holds everything the registry tracks for one connection:
//! cursors learned from the peer, our open wants (client side), our open
//! offers (server side), and the in-flight `(stream, head)` keys used to
//! dedupe range requests. All maps are guarded by short-lived locks that
//! are never held across an await; sends are serialized by an async lock.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
use hashlink::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vertex_net_codec::PeerSink;
use vertex_storage::StateStore;
use vertex_swarm_intervals::IntervalStore;
use vertex_swarm_primitives::{ChunkAddress, OverlayAddress};
use vertex_tasks::{Shutdown, ShutdownSignal};

use crate::{StreamId, StreamMessage, SyncError, SyncResult};

/// Closed wants whose ruids are remembered so late replies are not taken
/// as protocol violations.
const RETIRED_RUIDS: usize = 256;

/// Key deduping range requests: a stream has at most one historical and
/// one live request in flight per direction.
type RangeKey = (StreamId, bool);

/// Client-side record of a [`GetRange`](crate::GetRange) we sent.
#[derive(Debug)]
pub struct Want {
    pub(crate) ruid: u32,
    pub(crate) stream: StreamId,
    pub(crate) from: u64,
    to: Mutex<Option<u64>>,
    pub(crate) head: bool,
    hashes: Mutex<HashSet<ChunkAddress>>,
    remaining: AtomicUsize,
    chunks_tx: mpsc::Sender<ChunkAddress>,
    chunks_rx: Mutex<Option<mpsc::Receiver<ChunkAddress>>>,
    closed: Shutdown,
}

impl Want {
    pub(crate) fn new(
        ruid: u32,
        stream: StreamId,
        from: u64,
        to: Option<u64>,
        buffer: usize,
    ) -> Self {
        let (chunks_tx, chunks_rx) = mpsc::channel(buffer.max(1));
        Self {
            ruid,
            stream,
            from,
            to: Mutex::new(to),
            head: to.is_none(),
            hashes: Mutex::new(HashSet::new()),
            remaining: AtomicUsize::new(0),
            chunks_tx,
            chunks_rx: Mutex::new(Some(chunks_rx)),
            closed: Shutdown::new(),
        }
    }

    pub(crate) fn to(&self) -> Option<u64> {
        *self.to.lock()
    }

    pub(crate) fn set_to(&self, to: u64) {
        *self.to.lock() = Some(to);
    }

    /// Registers the addresses requested from the offer.
    pub(crate) fn expect(&self, addresses: impl IntoIterator<Item = ChunkAddress>) -> usize {
        let mut hashes = self.hashes.lock();
        hashes.extend(addresses);
        self.remaining.store(hashes.len(), Ordering::Release);
        hashes.len()
    }

    /// Accounts for one delivered chunk. Returns the number still missing,
    /// or an error if the chunk was never requested.
    pub(crate) fn delivered(&self, address: &ChunkAddress) -> SyncResult<usize> {
        if !self.hashes.lock().remove(address) {
            return Err(SyncError::Unsolicited(*address));
        }
        Ok(self.remaining.fetch_sub(1, Ordering::AcqRel).saturating_sub(1))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Hands a delivered address to the seal task.
    pub(crate) async fn forward(&self, address: ChunkAddress) -> bool {
        self.chunks_tx.send(address).await.is_ok()
    }

    /// The receiver for the seal task. Only the first caller gets it.
    pub(crate) fn take_chunks(&self) -> Option<mpsc::Receiver<ChunkAddress>> {
        self.chunks_rx.lock().take()
    }

    pub(crate) fn close(&self) {
        self.closed.signal();
    }

    pub(crate) fn closed(&self) -> ShutdownSignal {
        self.closed.subscribe()
    }
}

/// Server-side record of an [`OfferedHashes`](crate::OfferedHashes) we sent.
#[derive(Debug, Clone)]
pub(crate) struct Offer {
    pub(crate) stream: StreamId,
    pub(crate) hashes: Bytes,
    pub(crate) requested_at: Instant,
}

#[derive(Debug, Default)]
struct RangeKeys {
    client: HashSet<RangeKey>,
    server: HashSet<RangeKey>,
}

/// Releases a server-side range key when the handler finishes.
pub(crate) struct ServingRange<'a> {
    peer: &'a Peer,
    key: RangeKey,
}

impl Drop for ServingRange<'_> {
    fn drop(&mut self) {
        self.peer.ranges.lock().server.remove(&self.key);
    }
}

/// Stream session with one connected peer.
pub struct Peer {
    overlay: OverlayAddress,
    sink: Arc<dyn PeerSink<StreamMessage>>,
    send_lock: tokio::sync::Mutex<()>,
    intervals: IntervalStore<Arc<dyn StateStore>>,
    intervals_lock: Mutex<()>,
    cursors: Mutex<HashMap<StreamId, u64>>,
    wants: Mutex<HashMap<u32, Arc<Want>>>,
    offers: Mutex<HashMap<u32, Offer>>,
    ranges: Mutex<RangeKeys>,
    retired: Mutex<LruCache<u32, ()>>,
    quit: Shutdown,
    registry_quit: ShutdownSignal,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("overlay", &self.overlay)
            .field("cursors", &self.cursors.lock().len())
            .field("wants", &self.wants_len())
            .field("offers", &self.offers_len())
            .finish_non_exhaustive()
    }
}

impl Peer {
    pub(crate) fn new(
        overlay: OverlayAddress,
        sink: Arc<dyn PeerSink<StreamMessage>>,
        intervals: Arc<dyn StateStore>,
        registry_quit: ShutdownSignal,
    ) -> Self {
        Self {
            overlay,
            sink,
            send_lock: tokio::sync::Mutex::new(()),
            intervals: IntervalStore::new(intervals),
            intervals_lock: Mutex::new(()),
            cursors: Mutex::new(HashMap::new()),
            wants: Mutex::new(HashMap::new()),
            offers: Mutex::new(HashMap::new()),
            ranges: Mutex::new(RangeKeys::default()),
            retired: Mutex::new(LruCache::new(RETIRED_RUIDS)),
            quit: Shutdown::new(),
            registry_quit,
        }
    }

    pub fn overlay(&self) -> &OverlayAddress {
        &self.overlay
    }

    /// Sends `msg`, waiting for earlier sends to this peer to finish.
    pub async fn send(&self, msg: impl Into<StreamMessage>) -> SyncResult<()> {
        let msg = msg.into();
        let closed = self.closed();
        tokio::pin!(closed);
        let _guard = tokio::select! {
            guard = self.send_lock.lock() => guard,
            _ = &mut closed => return Err(SyncError::Shutdown),
        };
        tokio::select! {
            sent = self.sink.send(msg) => Ok(sent?),
            _ = &mut closed => Err(SyncError::Shutdown),
        }
    }

    /// Resolves once the peer session or the registry is closed.
    pub async fn closed(&self) {
        let peer = self.quit.subscribe().wait();
        let registry = self.registry_quit.wait();
        tokio::select! {
            _ = peer => {}
            _ = registry => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.quit.is_signalled() || self.registry_quit.is_signalled()
    }

    pub fn cursor(&self, stream: &StreamId) -> Option<u64> {
        self.cursors.lock().get(stream).copied()
    }

    pub(crate) fn set_cursor(&self, stream: StreamId, cursor: u64) {
        self.cursors.lock().insert(stream, cursor);
    }

    pub fn delete_cursor(&self, stream: &StreamId) -> Option<u64> {
        self.cursors.lock().remove(stream)
    }

    /// Snapshot of all cursors learned from this peer.
    pub fn cursors(&self) -> HashMap<StreamId, u64> {
        self.cursors.lock().clone()
    }

    /// Claims the client-side `(stream, head)` key. False if a request for
    /// it is already in flight.
    pub(crate) fn try_claim_want(&self, stream: &StreamId, head: bool) -> bool {
        self.ranges.lock().client.insert((stream.clone(), head))
    }

    pub(crate) fn insert_want(&self, want: Arc<Want>) {
        self.wants.lock().insert(want.ruid, want);
    }

    pub(crate) fn want(&self, ruid: u32) -> Option<Arc<Want>> {
        self.wants.lock().get(&ruid).cloned()
    }

    /// Removes the want and releases its `(stream, head)` key.
    pub(crate) fn delete_want(&self, ruid: u32) -> Option<Arc<Want>> {
        let want = self.wants.lock().remove(&ruid)?;
        self.ranges
            .lock()
            .client
            .remove(&(want.stream.clone(), want.head));
        Some(want)
    }

    /// Unused random ruid for a new want.
    pub(crate) fn next_ruid(&self) -> u32 {
        let wants = self.wants.lock();
        loop {
            let ruid = rand::random::<u32>();
            if !wants.contains_key(&ruid) {
                return ruid;
            }
        }
    }

    /// Closes and forgets every open want on `stream`, including wants whose
    /// chunks are still being delivered. Late replies to them are ignored
    /// rather than treated as unknown, and chunks delivered for a stream the
    /// peer no longer syncs are dropped, so nothing is sealed for it.
    pub fn close_wants(&self, stream: &StreamId) {
        let closed: Vec<u32> = self
            .wants
            .lock()
            .values()
            .filter(|w| &w.stream == stream)
            .map(|w| w.ruid)
            .collect();
        for ruid in closed {
            if let Some(want) = self.delete_want(ruid) {
                want.close();
                self.retired.lock().insert(ruid, ());
                debug!(peer = %self.overlay, ruid, %stream, "Closed want");
            }
        }
    }

    pub(crate) fn is_retired(&self, ruid: u32) -> bool {
        self.retired.lock().contains_key(&ruid)
    }

    pub(crate) fn wants_len(&self) -> usize {
        self.wants.lock().len()
    }

    /// Claims the server-side `(stream, head)` key for the guard's lifetime.
    pub(crate) fn try_serve_range(&self, stream: &StreamId, head: bool) -> Option<ServingRange<'_>> {
        let key = (stream.clone(), head);
        self.ranges
            .lock()
            .server
            .insert(key.clone())
            .then_some(ServingRange { peer: self, key })
    }

    pub(crate) fn insert_offer(&self, ruid: u32, offer: Offer) {
        self.offers.lock().insert(ruid, offer);
    }

    pub(crate) fn take_offer(&self, ruid: u32) -> Option<Offer> {
        self.offers.lock().remove(&ruid)
    }

    pub(crate) fn offers_len(&self) -> usize {
        self.offers.lock().len()
    }

    fn interval_key(&self, stream: &StreamId) -> String {
        format!("{}|{}|{}", self.overlay.to_hex(), stream.name, stream.key)
    }

    /// Next range of `stream` not yet synced from this peer, see
    /// [`Intervals::next`](vertex_swarm_intervals::Intervals::next).
    pub fn next_interval(&self, stream: &StreamId, ceil: u64) -> SyncResult<(u64, u64, bool)> {
        let _guard = self.intervals_lock.lock();
        Ok(self.intervals.get(&self.interval_key(stream))?.next(ceil))
    }

    /// Records `[from, to]` of `stream` as synced from this peer.
    pub(crate) fn seal(&self, stream: &StreamId, from: u64, to: u64) -> SyncResult<()> {
        let _guard = self.intervals_lock.lock();
        self.intervals.add(&self.interval_key(stream), from, to)?;
        Ok(())
    }

    /// Synced ranges of `stream`.
    pub fn intervals(&self, stream: &StreamId) -> SyncResult<Vec<(u64, u64)>> {
        let _guard = self.intervals_lock.lock();
        Ok(self
            .intervals
            .get(&self.interval_key(stream))?
            .ranges()
            .to_vec())
    }

    /// Tears the session down: quits its tasks and drops all open wants and
    /// offers. Interval sets are kept for the next connection.
    pub(crate) fn close(&self) {
        self.quit.signal();
        let wants: Vec<Arc<Want>> = self.wants.lock().drain().map(|(_, w)| w).collect();
        for want in wants {
            want.close();
        }
        self.offers.lock().clear();
        let mut ranges = self.ranges.lock();
        ranges.client.clear();
        ranges.server.clear();
    }

    /// Closes the session and asks the transport to disconnect.
    pub fn disconnect(&self, reason: &str) {
        warn!(peer = %self.overlay, reason, "Dropping peer");
        self.close();
        self.sink.disconnect(reason);
    }
}

/// Age of an open offer, for diagnostics.
impl Offer {
    pub(crate) fn age(&self) -> std::time::Duration {
        self.requested_at.elapsed()
    }
}
