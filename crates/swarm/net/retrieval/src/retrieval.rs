//! The retrieval service.
//!
//! A chunk missing locally is requested from the connected peer closest to
//! it. That peer answers from its store or forwards the request in turn,
//! so requests walk towards the chunk's neighbourhood one hop at a time.
//! Peers are only ever asked if they make progress towards the chunk,
//! which together with the hop limit keeps requests from looping.
//!
//! Fetches are deduplicated per address: concurrent callers (local or
//! forwarded) share one flight and its result.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Instant,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, time::sleep};
use tracing::{debug, trace, warn};
use vertex_net_codec::PeerSink;
use vertex_swarm_localstore::{ChunkStore, ModePut};
use vertex_swarm_primitives::{Chunk, ChunkAddress, OverlayAddress};
use vertex_swarm_topology::{Capability, LoadBalancer, Topology};
use vertex_tasks::{Shutdown, TaskGroup};

use crate::{
    ChunkDelivery, PendingRetrieval, RetrievalConfig, RetrievalError, RetrievalMessage,
    RetrievalPeer, RetrievalResult, RetrieveRequest, SkipSet, metrics::RetrievalMetrics,
};

/// A chunk lookup, local or forwarded on behalf of `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub address: ChunkAddress,
    /// Peer the request came from, `None` for our own lookups.
    pub origin: Option<OverlayAddress>,
    /// Hop count carried by the outgoing [`RetrieveRequest`].
    pub hop_count: u8,
}

impl Request {
    pub fn local(address: ChunkAddress) -> Self {
        Self {
            address,
            origin: None,
            hop_count: 0,
        }
    }
}

type Flight = Shared<BoxFuture<'static, RetrievalResult<Chunk>>>;

struct Inner<S, T> {
    store: S,
    topology: T,
    config: RetrievalConfig,
    balancer: LoadBalancer,
    peers: RwLock<HashMap<OverlayAddress, Arc<RetrievalPeer>>>,
    flights: Mutex<HashMap<ChunkAddress, (Instant, Flight)>>,
    deliveries: Mutex<HashMap<ChunkAddress, watch::Sender<Option<Chunk>>>>,
    quit: Shutdown,
    tasks: TaskGroup,
    metrics: RetrievalMetrics,
}

/// Retrieval protocol service. Cheap to clone.
pub struct Retrieval<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for Retrieval<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, T> std::fmt::Debug for Retrieval<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrieval")
            .field("peers", &self.inner.peers.read().len())
            .field("flights", &self.inner.flights.lock().len())
            .finish_non_exhaustive()
    }
}

/// Receiver for the delivery of one address. Unregisters on drop once no
/// other fetch is waiting for the same address.
struct DeliveryWatch<'a> {
    deliveries: &'a Mutex<HashMap<ChunkAddress, watch::Sender<Option<Chunk>>>>,
    address: ChunkAddress,
    rx: watch::Receiver<Option<Chunk>>,
}

impl DeliveryWatch<'_> {
    async fn wait(&mut self) -> RetrievalResult<Chunk> {
        let chunk = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RetrievalError::Shutdown)?;
        chunk.clone().ok_or(RetrievalError::Shutdown)
    }
}

impl Drop for DeliveryWatch<'_> {
    fn drop(&mut self) {
        let mut deliveries = self.deliveries.lock();
        if deliveries
            .get(&self.address)
            .is_some_and(|tx| tx.receiver_count() <= 1)
        {
            deliveries.remove(&self.address);
        }
    }
}

impl<S, T> Retrieval<S, T>
where
    S: ChunkStore + 'static,
    T: Topology + 'static,
{
    pub fn new(store: S, topology: T, config: RetrievalConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                topology,
                config,
                balancer: LoadBalancer::new(),
                peers: RwLock::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
                deliveries: Mutex::new(HashMap::new()),
                quit: Shutdown::new(),
                tasks: TaskGroup::new("retrieval"),
                metrics: RetrievalMetrics::default(),
            }),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.inner.config
    }

    pub fn add_peer(
        &self,
        overlay: OverlayAddress,
        sink: Arc<dyn PeerSink<RetrievalMessage>>,
    ) -> Arc<RetrievalPeer> {
        let peer = Arc::new(RetrievalPeer::new(overlay, sink));
        let mut peers = self.inner.peers.write();
        peers.insert(overlay, peer.clone());
        self.inner.metrics.peers.set(peers.len() as f64);
        debug!(peer = %overlay, "Retrieval peer added");
        peer
    }

    pub fn remove_peer(&self, overlay: &OverlayAddress) -> bool {
        let removed = {
            let mut peers = self.inner.peers.write();
            let removed = peers.remove(overlay).is_some();
            self.inner.metrics.peers.set(peers.len() as f64);
            removed
        };
        self.inner.balancer.remove(overlay);
        if removed {
            debug!(peer = %overlay, "Retrieval peer removed");
        }
        removed
    }

    pub fn peer(&self, overlay: &OverlayAddress) -> Option<Arc<RetrievalPeer>> {
        self.inner.peers.read().get(overlay).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Hands an inbound message to its handler task.
    pub fn handle_message(&self, overlay: &OverlayAddress, msg: RetrievalMessage) {
        if self.inner.quit.is_signalled() {
            return;
        }
        let Some(peer) = self.peer(overlay) else {
            debug!(peer = %overlay, msg = msg.name(), "Message from unknown retrieval peer");
            return;
        };
        let this = self.clone();
        let name = msg.name();
        self.inner.tasks.spawn(async move {
            let result = match msg {
                RetrievalMessage::RetrieveRequest(msg) => {
                    this.handle_retrieve_request(&peer, msg).await
                }
                RetrievalMessage::ChunkDelivery(msg) => this.handle_chunk_delivery(&peer, msg),
            };
            this.handle_result(&peer, name, result);
        });
    }

    fn handle_result(&self, peer: &RetrievalPeer, handler: &'static str, result: RetrievalResult<()>) {
        match result {
            Ok(()) => {}
            Err(RetrievalError::Shutdown) => {}
            Err(err) if err.is_fatal() => {
                self.remove_peer(peer.overlay());
                peer.disconnect(&format!("{handler}: {err}"));
            }
            Err(err) => debug!(peer = %peer.overlay(), handler, %err, "Retrieval handler failed"),
        }
    }

    /// Fetches a chunk for this node.
    pub async fn retrieve(&self, address: ChunkAddress) -> RetrievalResult<Chunk> {
        self.fetch(Request::local(address)).await
    }

    /// Returns the chunk from the local store or fetches it from the
    /// network, joining an in-flight fetch of the same address.
    pub async fn fetch(&self, request: Request) -> RetrievalResult<Chunk> {
        if self.inner.quit.is_signalled() {
            return Err(RetrievalError::Shutdown);
        }
        if let Some(chunk) = self.local_chunk(&request.address)? {
            return Ok(chunk);
        }

        let address = request.address;
        let flight = {
            let mut flights = self.inner.flights.lock();
            match flights.get(&address) {
                // a flight nobody polled past its deadline is stale
                Some((started, flight)) if started.elapsed() < self.inner.config.global_timeout => {
                    self.inner.metrics.singleflight_join.increment(1);
                    flight.clone()
                }
                _ => {
                    let this = self.clone();
                    let flight = async move {
                        let result = this.fetch_remote(request).await;
                        this.inner.flights.lock().remove(&address);
                        result
                    }
                    .boxed()
                    .shared();
                    flights.insert(address, (Instant::now(), flight.clone()));
                    flight
                }
            }
        };
        flight.await
    }

    fn local_chunk(&self, address: &ChunkAddress) -> RetrievalResult<Option<Chunk>> {
        if !self.inner.store.has(address)? {
            return Ok(None);
        }
        Ok(Some(self.inner.store.get(address)?))
    }

    fn watch_delivery(&self, address: ChunkAddress) -> DeliveryWatch<'_> {
        let rx = self
            .inner
            .deliveries
            .lock()
            .entry(address)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();
        DeliveryWatch {
            deliveries: &self.inner.deliveries,
            address,
            rx,
        }
    }

    /// Asks peers one after the other until one delivers, the chunk shows
    /// up locally, or the global deadline passes.
    async fn fetch_remote(&self, request: Request) -> RetrievalResult<Chunk> {
        let address = request.address;
        let config = &self.inner.config;
        let deadline = Instant::now() + config.global_timeout;
        let mut delivery = self.watch_delivery(address);
        let mut skip = SkipSet::new(config.failed_peer_skip_ttl);
        let quit = self.inner.quit.subscribe();

        loop {
            let (peer, _pending) = self.request_from_peers(&request, &mut skip).await?;
            let wait = config
                .search_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                chunk = delivery.wait() => return chunk,
                _ = sleep(wait) => {}
                _ = quit.wait() => return Err(RetrievalError::Shutdown),
            }

            if let Some(chunk) = self.local_chunk(&address)? {
                return Ok(chunk);
            }
            if Instant::now() >= deadline {
                self.inner.metrics.fetch_timeout.increment(1);
                debug!(%address, "Fetch timed out");
                return Err(RetrievalError::DeadlineExceeded(address));
            }
            self.inner.metrics.search_timeout.increment(1);
            debug!(%address, %peer, "No delivery in time, trying next peer");
            skip.insert(peer);
        }
    }

    /// Picks the peer to ask for `request.address`.
    ///
    /// Outside our neighbourhood only peers strictly closer to the chunk
    /// than us qualify. Inside it, any neighbour qualifies as long as it is
    /// closer to the chunk than the origin. Within a bin the least recently
    /// chosen peer wins.
    pub fn find_peer(&self, request: &Request, skip: &SkipSet) -> RetrievalResult<OverlayAddress> {
        let topology = &self.inner.topology;
        let address = &request.address;
        let depth = topology.depth();
        let my_po = topology.base().proximity(address);
        let origin_po = request.origin.map(|origin| origin.proximity(address));

        if origin_po.is_some_and(|po| po > my_po) {
            return Err(RetrievalError::OriginCloser);
        }

        let bins = self
            .inner
            .balancer
            .order(topology.peers_by_proximity(address, Capability::Retrieval));
        for bin in bins {
            for peer in &bin.peers {
                if request.origin.as_ref() == Some(peer) || skip.contains(peer) {
                    continue;
                }
                let suitable = if my_po < depth {
                    bin.po > my_po
                } else {
                    bin.po >= depth && origin_po.is_none_or(|origin| bin.po > origin)
                };
                // bins are ordered closest first, nothing further on qualifies
                if !suitable {
                    trace!(%address, po = bin.po, my_po, depth, ?origin_po, "No peer makes progress");
                    return Err(RetrievalError::NoSuitablePeer);
                }
                self.inner.balancer.add_use(peer);
                return Ok(*peer);
            }
        }
        Err(RetrievalError::NoSuitablePeer)
    }

    /// Sends a [`RetrieveRequest`] to the best peer not in `skip`. The
    /// returned handle expires the request record when dropped.
    pub async fn request_from_peers(
        &self,
        request: &Request,
        skip: &mut SkipSet,
    ) -> RetrievalResult<(OverlayAddress, PendingRetrieval)> {
        self.inner.metrics.request_from_peers.increment(1);
        let mut retries = 0;
        loop {
            let overlay = self.find_peer(request, skip)?;
            let Some(peer) = self.peer(&overlay) else {
                retries += 1;
                warn!(peer = %overlay, retries, address = %request.address, "Selected peer has no retrieval session");
                skip.insert(overlay);
                if retries >= self.inner.config.max_find_peer_retries {
                    return Err(RetrievalError::NoSuitablePeer);
                }
                sleep(self.inner.config.retry_backoff(retries)).await;
                continue;
            };

            let ruid = peer.add_retrieval(request.address);
            let pending = PendingRetrieval::new(peer.clone(), ruid);
            trace!(peer = %overlay, ruid, address = %request.address, hop_count = request.hop_count, "Sending retrieve request");
            peer.send(RetrieveRequest {
                ruid,
                address: request.address,
                hop_count: request.hop_count,
            })
            .await?;
            return Ok((overlay, pending));
        }
    }

    async fn handle_retrieve_request(
        &self,
        peer: &RetrievalPeer,
        msg: RetrieveRequest,
    ) -> RetrievalResult<()> {
        self.inner.metrics.handle_retrieve_request.increment(1);
        if msg.hop_count >= self.inner.config.max_hop_count {
            self.inner.metrics.hop_limit.increment(1);
            return Err(RetrievalError::HopLimit {
                address: msg.address,
                hops: msg.hop_count,
            });
        }

        let request = Request {
            address: msg.address,
            origin: Some(*peer.overlay()),
            hop_count: msg.hop_count.saturating_add(1),
        };
        let fetched = tokio::time::timeout(self.inner.config.global_timeout, self.fetch(request))
            .await
            .unwrap_or(Err(RetrievalError::DeadlineExceeded(msg.address)));
        let chunk = match fetched {
            Ok(chunk) => chunk,
            Err(err) => {
                // the requester times out and tries elsewhere
                self.inner.metrics.retrieve_chunk_fail.increment(1);
                return Err(err);
            }
        };

        trace!(peer = %peer.overlay(), ruid = msg.ruid, address = %msg.address, "Delivering chunk");
        peer.send(ChunkDelivery {
            ruid: msg.ruid,
            address: msg.address,
            data: chunk.data().clone(),
        })
        .await
    }

    fn handle_chunk_delivery(&self, peer: &RetrievalPeer, msg: ChunkDelivery) -> RetrievalResult<()> {
        if let Err(err) = peer.check_retrieval(msg.ruid, &msg.address) {
            self.inner.metrics.unsolicited_delivery.increment(1);
            return Err(err);
        }
        self.inner.metrics.chunk_delivery.increment(1);

        let chunk = Chunk::new(msg.address, msg.data);
        let po = self.inner.topology.base().proximity(&msg.address);
        let peer_po = peer.overlay().proximity(&msg.address);
        let mode = if po >= self.inner.topology.depth() || peer_po < po {
            ModePut::Sync
        } else {
            ModePut::Request
        };
        self.inner.store.put(mode, std::slice::from_ref(&chunk))?;
        debug!(peer = %peer.overlay(), ruid = msg.ruid, address = %msg.address, %mode, "Chunk delivered");

        if let Some(tx) = self.inner.deliveries.lock().get(&msg.address) {
            tx.send_replace(Some(chunk));
        }
        Ok(())
    }

    /// Cancels all fetches and waits for the handlers to finish. Idempotent.
    pub async fn stop(&self) {
        self.inner.quit.signal();
        self.inner.flights.lock().clear();
        self.inner.peers.write().clear();
        self.inner.metrics.peers.set(0.0);
        if !self
            .inner
            .tasks
            .wait_idle_timeout(self.inner.config.stop_timeout)
            .await
        {
            warn!(active = self.inner.tasks.active(), "Retrieval handlers did not stop in time");
        }
        debug!("Retrieval stopped");
    }
}

#[cfg(test)]
mod tests;
