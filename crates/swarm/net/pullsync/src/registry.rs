//! Stream registry: owns the peer sessions and runs the protocol handlers.
//!
//! Every inbound message is handled on its own task so a slow handler
//! (a server collecting a live batch, a client waiting for a delivery)
//! never blocks the peer's reader. Handlers return [`SyncResult`]; fatal
//! errors disconnect the peer, everything else is logged.
//!
//! # Client flow
//!
//! `StreamInfoReq` → `StreamInfoRes` gives us the peer's cursor per stream.
//! History is fetched up to the cursor through the gaps of the peer's
//! interval set; the live head is followed from `cursor + 1`. Each
//! `GetRange` is answered by an `OfferedHashes`, which we answer with a
//! `WantedHashes` bitvector. Once every wanted chunk has arrived (or none
//! was wanted) the range is sealed into the interval set and the next one
//! requested.

use std::{collections::HashMap, sync::Arc};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::{
    sync::mpsc,
    time::{Instant, sleep, timeout},
};
use tracing::{debug, trace, warn};
use vertex_net_codec::PeerSink;
use vertex_storage::StateStore;
use vertex_swarm_bitvector::BitVector;
use vertex_swarm_primitives::{ChunkAddress, HASH_SIZE, OverlayAddress};
use vertex_tasks::{Shutdown, TaskGroup};

use crate::{
    ChunkDelivery, GetRange, OfferedHashes, Peer, PullsyncConfig, StreamId, StreamInfo,
    StreamInfoReq, StreamInfoRes, StreamMessage, StreamProvider, SyncError, SyncResult,
    WantedHashes,
    messages::split_hashes,
    metrics::PullsyncMetrics,
    peer::{Offer, Want},
};

/// Descriptors collected by the server for one `GetRange`.
#[derive(Debug)]
struct Batch {
    hashes: Bytes,
    first: u64,
    last: u64,
    count: usize,
}

struct Inner {
    config: PullsyncConfig,
    intervals: Arc<dyn StateStore>,
    providers: HashMap<String, Arc<dyn StreamProvider>>,
    peers: RwLock<HashMap<OverlayAddress, Arc<Peer>>>,
    quit: Shutdown,
    tasks: TaskGroup,
    metrics: PullsyncMetrics,
}

/// Pull-sync registry. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("providers", &self.inner.providers.keys().collect::<Vec<_>>())
            .field("peers", &self.inner.peers.read().len())
            .field("handlers", &self.inner.tasks.active())
            .finish()
    }
}

impl Registry {
    /// Creates a registry serving `providers`, persisting interval sets in
    /// `intervals`.
    pub fn new(
        config: PullsyncConfig,
        intervals: Arc<dyn StateStore>,
        providers: impl IntoIterator<Item = Arc<dyn StreamProvider>>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_owned(), p))
            .collect();
        Self {
            inner: Arc::new(Inner {
                config,
                intervals,
                providers,
                peers: RwLock::new(HashMap::new()),
                quit: Shutdown::new(),
                tasks: TaskGroup::new("pullsync"),
                metrics: PullsyncMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &PullsyncConfig {
        &self.inner.config
    }

    /// Creates the session for a newly connected peer and starts each
    /// provider's per-peer task.
    pub fn add_peer(
        &self,
        overlay: OverlayAddress,
        sink: Arc<dyn PeerSink<StreamMessage>>,
    ) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(
            overlay,
            sink,
            self.inner.intervals.clone(),
            self.inner.quit.subscribe(),
        ));
        let replaced = {
            let mut peers = self.inner.peers.write();
            let replaced = peers.insert(overlay, peer.clone());
            self.inner.metrics.peers.set(peers.len() as f64);
            replaced
        };
        if let Some(old) = replaced {
            old.close();
        }
        debug!(peer = %overlay, "Stream peer added");

        if self.inner.quit.is_signalled() {
            return peer;
        }
        for provider in self.inner.providers.values() {
            let registry = self.clone();
            let provider = provider.clone();
            let session = peer.clone();
            self.inner.tasks.spawn(async move {
                let result = provider.init_peer(session.clone()).await;
                registry.handle_result(&session, "init_peer", result);
            });
        }
        peer
    }

    /// Closes and forgets a peer's session. Returns false if unknown.
    pub fn remove_peer(&self, overlay: &OverlayAddress) -> bool {
        let removed = {
            let mut peers = self.inner.peers.write();
            let removed = peers.remove(overlay);
            self.inner.metrics.peers.set(peers.len() as f64);
            removed
        };
        match removed {
            Some(peer) => {
                peer.close();
                debug!(peer = %overlay, "Stream peer removed");
                true
            }
            None => false,
        }
    }

    pub fn peer(&self, overlay: &OverlayAddress) -> Option<Arc<Peer>> {
        self.inner.peers.read().get(overlay).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Cursors learned from every connected peer.
    pub fn peer_cursors(&self) -> HashMap<OverlayAddress, HashMap<StreamId, u64>> {
        self.inner
            .peers
            .read()
            .iter()
            .map(|(overlay, peer)| (*overlay, peer.cursors()))
            .collect()
    }

    /// Hands an inbound message to its handler.
    pub fn handle_message(&self, overlay: &OverlayAddress, msg: StreamMessage) {
        if self.inner.quit.is_signalled() {
            return;
        }
        let Some(peer) = self.peer(overlay) else {
            debug!(peer = %overlay, msg = msg.name(), "Message from unknown stream peer");
            return;
        };
        if let StreamMessage::Unknown(tag) = msg {
            debug!(peer = %overlay, tag, "Ignoring unknown stream message");
            return;
        }

        let registry = self.clone();
        let name = msg.name();
        self.inner.tasks.spawn(async move {
            let result = registry.dispatch(&peer, msg).await;
            registry.handle_result(&peer, name, result);
        });
    }

    /// Quits every session and waits for the handlers to finish, at most
    /// [`PullsyncConfig::stop_timeout`]. Idempotent.
    pub async fn stop(&self) {
        self.inner.quit.signal();
        for provider in self.inner.providers.values() {
            provider.close();
        }
        let peers: Vec<Arc<Peer>> = self.inner.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close();
        }
        self.inner.metrics.peers.set(0.0);

        if !self
            .inner
            .tasks
            .wait_idle_timeout(self.inner.config.stop_timeout)
            .await
        {
            warn!(active = self.inner.tasks.active(), "Stream handlers did not stop in time");
        }
        debug!("Stream registry stopped");
    }

    fn handle_result(&self, peer: &Arc<Peer>, handler: &'static str, result: SyncResult<()>) {
        let Err(err) = result else {
            return;
        };
        if err.is_shutdown() {
            trace!(peer = %peer.overlay(), handler, "Handler stopped by shutdown");
        } else if err.is_fatal() {
            self.inner.metrics.dropped_peers.increment(1);
            {
                let mut peers = self.inner.peers.write();
                if peers.get(peer.overlay()).is_some_and(|p| Arc::ptr_eq(p, peer)) {
                    peers.remove(peer.overlay());
                    self.inner.metrics.peers.set(peers.len() as f64);
                }
            }
            peer.disconnect(&format!("{handler}: {err}"));
        } else {
            warn!(peer = %peer.overlay(), handler, %err, "Stream handler failed");
        }
    }

    fn provider(&self, stream: &StreamId) -> SyncResult<Arc<dyn StreamProvider>> {
        self.inner
            .providers
            .get(&stream.name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownProvider(stream.name.clone()))
    }

    async fn dispatch(&self, peer: &Arc<Peer>, msg: StreamMessage) -> SyncResult<()> {
        match msg {
            StreamMessage::StreamInfoReq(msg) => self.server_stream_info_req(peer, msg).await,
            StreamMessage::StreamInfoRes(msg) => self.client_stream_info_res(peer, msg).await,
            StreamMessage::GetRange(msg) => self.server_get_range(peer, msg).await,
            StreamMessage::OfferedHashes(msg) => self.client_offered_hashes(peer, msg).await,
            StreamMessage::WantedHashes(msg) => self.server_wanted_hashes(peer, msg).await,
            StreamMessage::ChunkDelivery(msg) => self.client_chunk_delivery(peer, msg).await,
            StreamMessage::Unknown(_) => Ok(()),
        }
    }

    async fn server_stream_info_req(&self, peer: &Peer, msg: StreamInfoReq) -> SyncResult<()> {
        if msg.streams.is_empty() {
            return Err(SyncError::Protocol("empty stream info request".into()));
        }
        let mut streams = Vec::with_capacity(msg.streams.len());
        for stream in msg.streams {
            let provider = self.provider(&stream)?;
            let key = provider.parse_key(&stream.key)?;
            streams.push(StreamInfo {
                cursor: provider.cursor(key)?,
                bounded: provider.bounded(),
                stream,
            });
        }
        debug!(peer = %peer.overlay(), streams = streams.len(), "Sending stream info");
        peer.send(StreamInfoRes { streams }).await
    }

    async fn client_stream_info_res(&self, peer: &Peer, msg: StreamInfoRes) -> SyncResult<()> {
        if msg.streams.is_empty() {
            return Err(SyncError::Protocol("empty stream info response".into()));
        }
        for info in msg.streams {
            let provider = self.provider(&info.stream)?;
            if !provider.want_stream(peer.overlay(), &info.stream) {
                if peer.delete_cursor(&info.stream).is_some() {
                    debug!(peer = %peer.overlay(), stream = %info.stream, "Removed cursor of unwanted stream");
                }
                continue;
            }
            if peer.cursor(&info.stream).is_some() {
                trace!(peer = %peer.overlay(), stream = %info.stream, "Cursor already known");
                continue;
            }

            debug!(peer = %peer.overlay(), stream = %info.stream, cursor = info.cursor, "Stream cursor");
            peer.set_cursor(info.stream.clone(), info.cursor);
            if !provider.autostart() {
                continue;
            }
            if info.cursor > 0 {
                self.request_stream_range(peer, info.stream.clone(), info.cursor)
                    .await?;
            }
            if !info.bounded {
                self.request_stream_head(peer, info.stream, info.cursor.saturating_add(1))
                    .await?;
            }
        }
        Ok(())
    }

    /// Requests the first unsynced range of history up to `cursor`.
    async fn request_stream_range(
        &self,
        peer: &Peer,
        stream: StreamId,
        cursor: u64,
    ) -> SyncResult<()> {
        let (from, _, empty) = peer.next_interval(&stream, 0)?;
        if empty || from > cursor {
            debug!(peer = %peer.overlay(), %stream, cursor, "History synced");
            return Ok(());
        }
        self.send_want(peer, stream, from, Some(cursor)).await
    }

    async fn request_stream_head(&self, peer: &Peer, stream: StreamId, from: u64) -> SyncResult<()> {
        self.send_want(peer, stream, from, None).await
    }

    async fn send_want(
        &self,
        peer: &Peer,
        stream: StreamId,
        from: u64,
        to: Option<u64>,
    ) -> SyncResult<()> {
        if !peer.try_claim_want(&stream, to.is_none()) {
            trace!(peer = %peer.overlay(), %stream, live = to.is_none(), "Range already requested");
            return Ok(());
        }
        let batch_size = self.inner.config.effective_batch_size();
        let ruid = peer.next_ruid();
        peer.insert_want(Arc::new(Want::new(ruid, stream.clone(), from, to, batch_size)));

        debug!(peer = %peer.overlay(), ruid, %stream, from, ?to, "Requesting range");
        let msg = GetRange {
            ruid,
            stream,
            from,
            to,
            batch_size: u32::try_from(batch_size).unwrap_or(u32::MAX),
        };
        if let Err(err) = peer.send(msg).await {
            peer.delete_want(ruid);
            return Err(err);
        }
        Ok(())
    }

    async fn server_get_range(&self, peer: &Peer, msg: GetRange) -> SyncResult<()> {
        let provider = self.provider(&msg.stream)?;
        let key = provider.parse_key(&msg.stream.key)?;
        if let Some(to) = msg.to
            && to < msg.from
        {
            return Err(SyncError::Protocol(format!(
                "range [{}, {to}] of {} is inverted",
                msg.from, msg.stream
            )));
        }

        let live = msg.to.is_none();
        let Some(_serving) = peer.try_serve_range(&msg.stream, live) else {
            trace!(peer = %peer.overlay(), stream = %msg.stream, live, "Range already being served");
            return Ok(());
        };

        let limit = match msg.batch_size as usize {
            0 => self.inner.config.effective_batch_size(),
            n => n.min(self.inner.config.effective_batch_size()),
        };
        let batch = self
            .collect_batch(peer, provider.as_ref(), key, msg.from, msg.to, limit)
            .await?;

        let Some(batch) = batch else {
            if live {
                // the live subscription only ends early when the store closes
                return Ok(());
            }
            self.inner.metrics.empty_offered_hashes.increment(1);
            let last_index = msg.to.unwrap_or(msg.from);
            trace!(peer = %peer.overlay(), ruid = msg.ruid, stream = %msg.stream, last_index, "Empty range");
            return peer
                .send(OfferedHashes {
                    ruid: msg.ruid,
                    last_index,
                    hashes: Bytes::new(),
                })
                .await;
        };

        debug!(
            peer = %peer.overlay(),
            ruid = msg.ruid,
            stream = %msg.stream,
            from = batch.first,
            to = batch.last,
            hashes = batch.count,
            "Offering batch"
        );
        peer.insert_offer(
            msg.ruid,
            Offer {
                stream: msg.stream,
                hashes: batch.hashes.clone(),
                requested_at: std::time::Instant::now(),
            },
        );
        self.inner.metrics.offered_hashes.increment(1);
        let offered = OfferedHashes {
            ruid: msg.ruid,
            last_index: batch.last,
            hashes: batch.hashes,
        };
        if let Err(err) = peer.send(offered).await {
            peer.take_offer(msg.ruid);
            return Err(err);
        }
        Ok(())
    }

    /// Collects up to `limit` descriptors. Historical ranges answer within
    /// one batch timeout even when empty; live ranges wait for their first
    /// descriptor and then close the batch after a quiet batch timeout.
    async fn collect_batch(
        &self,
        peer: &Peer,
        provider: &dyn StreamProvider,
        key: u64,
        from: u64,
        to: Option<u64>,
        limit: usize,
    ) -> SyncResult<Option<Batch>> {
        let mut descriptors = provider.subscribe(key, from, to)?;
        let batch_timeout = self.inner.config.batch_timeout;
        let timer = sleep(batch_timeout);
        tokio::pin!(timer);
        let mut armed = to.is_some();
        let closed = peer.closed();
        tokio::pin!(closed);

        let mut hashes = BytesMut::with_capacity(limit * HASH_SIZE);
        let mut first = None;
        let mut last = 0;
        let mut count = 0;
        loop {
            tokio::select! {
                descriptor = descriptors.recv() => {
                    let Some(descriptor) = descriptor else {
                        break;
                    };
                    hashes.extend_from_slice(descriptor.address.as_bytes());
                    first.get_or_insert(descriptor.bin_id);
                    last = descriptor.bin_id;
                    count += 1;
                    if count >= limit {
                        self.inner.metrics.collect_batch_full.increment(1);
                        break;
                    }
                    timer.as_mut().reset(Instant::now() + batch_timeout);
                    armed = true;
                }
                _ = &mut timer, if armed => {
                    self.inner.metrics.collect_batch_timer.increment(1);
                    break;
                }
                _ = &mut closed => return Err(SyncError::Shutdown),
            }
        }
        descriptors.stop();

        Ok(first.map(|first| Batch {
            hashes: hashes.freeze(),
            first,
            last,
            count,
        }))
    }

    async fn client_offered_hashes(&self, peer: &Peer, msg: OfferedHashes) -> SyncResult<()> {
        let Some(addresses) = msg.addresses() else {
            return Err(SyncError::Protocol(format!(
                "offered hashes length {} is not a multiple of {HASH_SIZE}",
                msg.hashes.len()
            )));
        };
        let Some(want) = peer.want(msg.ruid) else {
            if peer.is_retired(msg.ruid) {
                trace!(peer = %peer.overlay(), ruid = msg.ruid, "Offer for closed want");
                return peer
                    .send(WantedHashes {
                        ruid: msg.ruid,
                        bitvector: Bytes::new(),
                    })
                    .await;
            }
            return Err(SyncError::UnknownRuid(msg.ruid));
        };
        if msg.last_index < want.from {
            return Err(SyncError::Protocol(format!(
                "offer ends at {} before requested start {}",
                msg.last_index, want.from
            )));
        }
        let provider = self.provider(&want.stream)?;
        want.set_to(msg.last_index);

        if addresses.is_empty() {
            return self.seal_and_advance(peer, &want).await;
        }

        if !provider.want_stream(peer.overlay(), &want.stream) {
            peer.delete_want(want.ruid);
            self.inner.metrics.quit_unwanted.increment(1);
            return peer
                .send(WantedHashes {
                    ruid: msg.ruid,
                    bitvector: Bytes::new(),
                })
                .await;
        }

        let mut bitvector = BitVector::new(addresses.len());
        let mut wanted = Vec::new();
        for (i, address) in addresses.iter().enumerate() {
            match provider.need_data(address) {
                Ok(true) => {
                    bitvector.set(i);
                    wanted.push(*address);
                }
                Ok(false) => {}
                Err(err) => {
                    peer.delete_want(want.ruid);
                    return Err(err);
                }
            }
        }

        if wanted.is_empty() {
            self.inner.metrics.empty_wanted_hashes.increment(1);
            peer.send(WantedHashes {
                ruid: msg.ruid,
                bitvector: Bytes::new(),
            })
            .await?;
            return self.seal_and_advance(peer, &want).await;
        }

        let Some(chunks) = want.take_chunks() else {
            return Err(SyncError::Protocol(format!("second offer for ruid {}", msg.ruid)));
        };
        let expected = want.expect(wanted);
        self.inner.metrics.wanted_hashes.increment(1);
        debug!(
            peer = %peer.overlay(),
            ruid = msg.ruid,
            offered = addresses.len(),
            wanted = expected,
            "Requesting chunks"
        );
        if let Err(err) = peer
            .send(WantedHashes {
                ruid: msg.ruid,
                bitvector: Bytes::from(bitvector.into_bytes()),
            })
            .await
        {
            peer.delete_want(want.ruid);
            return Err(err);
        }

        self.seal_batch(peer, provider.as_ref(), &want, chunks).await
    }

    /// Waits until every wanted chunk of `want` was delivered, then seals.
    async fn seal_batch(
        &self,
        peer: &Peer,
        provider: &dyn StreamProvider,
        want: &Want,
        mut chunks: mpsc::Receiver<ChunkAddress>,
    ) -> SyncResult<()> {
        let delivery = await_delivery(peer, want, &mut chunks);
        match timeout(self.inner.config.client_batch_timeout, delivery).await {
            Ok(Ok(true)) => self.seal_and_advance(peer, want).await,
            Ok(Ok(false)) => {
                peer.delete_want(want.ruid);
                self.inner.metrics.quit_unwanted.increment(1);
                debug!(peer = %peer.overlay(), ruid = want.ruid, stream = %want.stream, "Want closed before delivery");
                Ok(())
            }
            Ok(Err(err)) => {
                want.close();
                peer.delete_want(want.ruid);
                Err(err)
            }
            Err(_) => {
                self.inner.metrics.batch_timeout.increment(1);
                want.close();
                peer.delete_want(want.ruid);
                warn!(
                    peer = %peer.overlay(),
                    ruid = want.ruid,
                    remaining = want.remaining(),
                    "Batch delivery timed out"
                );
                if provider.want_stream(peer.overlay(), &want.stream) {
                    return Err(SyncError::BatchTimeout { ruid: want.ruid });
                }
                Ok(())
            }
        }
    }

    /// Seals `[from, to]` of a completed want and requests what follows.
    async fn seal_and_advance(&self, peer: &Peer, want: &Want) -> SyncResult<()> {
        let to = want.to().unwrap_or(want.from);
        if to >= want.from {
            peer.seal(&want.stream, want.from, to)?;
            self.inner.metrics.sealed_intervals.increment(1);
            debug!(peer = %peer.overlay(), ruid = want.ruid, stream = %want.stream, from = want.from, to, "Sealed interval");
        }
        peer.delete_want(want.ruid);

        let Some(cursor) = peer.cursor(&want.stream) else {
            self.inner.metrics.quit_unwanted.increment(1);
            debug!(peer = %peer.overlay(), stream = %want.stream, "Stream no longer wanted");
            return Ok(());
        };
        if want.head {
            self.request_stream_head(peer, want.stream.clone(), to.saturating_add(1))
                .await
        } else {
            self.request_stream_range(peer, want.stream.clone(), cursor)
                .await
        }
    }

    async fn server_wanted_hashes(&self, peer: &Peer, msg: WantedHashes) -> SyncResult<()> {
        let offer = peer
            .take_offer(msg.ruid)
            .ok_or(SyncError::UnknownRuid(msg.ruid))?;
        let provider = self.provider(&offer.stream)?;
        let addresses = split_hashes(&offer.hashes).unwrap_or_default();

        if msg.bitvector.is_empty() {
            trace!(peer = %peer.overlay(), ruid = msg.ruid, age = ?offer.age(), "Offer declined");
            return provider.set(&addresses);
        }

        let bitvector = BitVector::from_bytes(&msg.bitvector, addresses.len())?;
        let wanted: Vec<ChunkAddress> = bitvector
            .iter_ones()
            .filter_map(|i| addresses.get(i).copied())
            .collect();
        let chunks = provider.get(&wanted)?;

        debug!(peer = %peer.overlay(), ruid = msg.ruid, chunks = chunks.len(), "Delivering chunks");
        for frame in chunks.chunks(self.inner.config.frame_size()) {
            peer.send(ChunkDelivery {
                ruid: msg.ruid,
                chunks: frame.to_vec(),
            })
            .await?;
            self.inner.metrics.chunks_sent.increment(frame.len() as u64);
        }
        provider.set(&addresses)
    }

    async fn client_chunk_delivery(&self, peer: &Peer, msg: ChunkDelivery) -> SyncResult<()> {
        let Some(want) = peer.want(msg.ruid) else {
            if peer.is_retired(msg.ruid) {
                trace!(peer = %peer.overlay(), ruid = msg.ruid, "Delivery for closed want");
                return Ok(());
            }
            return Err(SyncError::UnknownRuid(msg.ruid));
        };
        if want.remaining() == 0
            && let Some(chunk) = msg.chunks.first()
        {
            return Err(SyncError::Unsolicited(*chunk.address()));
        }
        let provider = self.provider(&want.stream)?;
        if !provider.want_stream(peer.overlay(), &want.stream) {
            trace!(peer = %peer.overlay(), ruid = msg.ruid, "Delivery for unwanted stream");
            return Ok(());
        }

        let seen = provider.put(&msg.chunks)?;
        let seen = seen.iter().filter(|s| **s).count();
        self.inner.metrics.seen_chunk_delivery.increment(seen as u64);
        self.inner
            .metrics
            .chunks_received
            .increment(msg.chunks.len() as u64);

        let closed = want.closed();
        for chunk in &msg.chunks {
            tokio::select! {
                forwarded = want.forward(*chunk.address()) => if !forwarded {
                    return Ok(());
                },
                _ = closed.wait() => return Ok(()),
                _ = peer.closed() => return Err(SyncError::Shutdown),
            }
        }
        Ok(())
    }
}

/// `Ok(true)` once every wanted chunk arrived, `Ok(false)` if the want was
/// closed first.
async fn await_delivery(
    peer: &Peer,
    want: &Want,
    chunks: &mut mpsc::Receiver<ChunkAddress>,
) -> SyncResult<bool> {
    let closed = want.closed();
    loop {
        tokio::select! {
            address = chunks.recv() => {
                let Some(address) = address else {
                    return Ok(false);
                };
                if want.delivered(&address)? == 0 {
                    return Ok(true);
                }
            }
            _ = closed.wait() => return Ok(false),
            _ = peer.closed() => return Err(SyncError::Shutdown),
        }
    }
}
