use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use vertex_net_codec::{CodecError, PeerSink};
use vertex_storage::{MemoryStateStore, StateStore};
use vertex_swarm_localstore::{ChunkCache, ChunkStore, MemoryChunkStore, ModePut, StoreResult};
use vertex_swarm_net_pullsync::{PullsyncConfig, Registry, StreamId, StreamProvider, SyncProvider};
use vertex_swarm_net_retrieval::{Retrieval, RetrievalConfig, RetrievalResult};
use vertex_swarm_primitives::{Chunk, ChunkAddress, OverlayAddress};
use vertex_swarm_topology::{
    Capabilities, Capability, Kademlia, KademliaConfig, KademliaPeer, Topology,
};
use vertex_tasks::Shutdown;

use crate::{Message, NodeArgs, NodeError, metrics::NodeMetrics, sink::ProtocolSink};

/// Retrieval service as wired by a [`Node`].
pub type NodeRetrieval = Retrieval<Arc<MemoryChunkStore>, Arc<Kademlia>>;

/// Settings of every component a [`Node`] runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub kademlia: KademliaConfig,
    pub pullsync: PullsyncConfig,
    pub retrieval: RetrievalConfig,
    /// Chunks kept in the pull-sync hot cache.
    pub cache_chunks: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeArgs::default().node_config()
    }
}

/// A Swarm node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    base: OverlayAddress,
    store: Arc<MemoryChunkStore>,
    topology: Arc<Kademlia>,
    pullsync: Registry,
    retrieval: NodeRetrieval,
    connections: RwLock<HashMap<OverlayAddress, Arc<dyn PeerSink<Message>>>>,
    quit: Shutdown,
    metrics: NodeMetrics,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("base", &self.inner.base)
            .field("depth", &self.depth())
            .field("connections", &self.inner.connections.read().len())
            .field("chunks", &self.inner.store.len())
            .finish()
    }
}

impl Node {
    /// Creates a node keeping its interval sets in memory.
    pub fn new(base: OverlayAddress, config: NodeConfig) -> Self {
        Self::with_state_store(base, config, Arc::new(MemoryStateStore::new()))
    }

    /// Creates a node persisting its interval sets in `intervals`.
    pub fn with_state_store(
        base: OverlayAddress,
        config: NodeConfig,
        intervals: Arc<dyn StateStore>,
    ) -> Self {
        let store = Arc::new(MemoryChunkStore::new(base));
        let topology = Arc::new(Kademlia::new(base, config.kademlia));
        let sync: Arc<dyn StreamProvider> = Arc::new(SyncProvider::new(
            store.clone(),
            topology.clone(),
            ChunkCache::new(config.cache_chunks),
            config.pullsync.clone(),
        ));
        let pullsync = Registry::new(config.pullsync, intervals, [sync]);
        let retrieval = Retrieval::new(store.clone(), topology.clone(), config.retrieval);

        Self {
            inner: Arc::new(Inner {
                base,
                store,
                topology,
                pullsync,
                retrieval,
                connections: RwLock::new(HashMap::new()),
                quit: Shutdown::new(),
                metrics: NodeMetrics::default(),
            }),
        }
    }

    /// Creates a node from CLI or file settings.
    pub fn from_args(args: &NodeArgs) -> eyre::Result<Self> {
        let base = args.overlay()?;
        let node = Self::with_state_store(base, args.node_config(), args.state_store()?);
        info!(%base, datadir = ?args.datadir, "Node created");
        Ok(node)
    }

    pub fn base(&self) -> OverlayAddress {
        self.inner.base
    }

    pub fn depth(&self) -> u8 {
        self.inner.topology.depth()
    }

    pub fn store(&self) -> &Arc<MemoryChunkStore> {
        &self.inner.store
    }

    pub fn topology(&self) -> &Arc<Kademlia> {
        &self.inner.topology
    }

    pub fn pullsync(&self) -> &Registry {
        &self.inner.pullsync
    }

    pub fn retrieval(&self) -> &NodeRetrieval {
        &self.inner.retrieval
    }

    pub fn is_connected(&self, overlay: &OverlayAddress) -> bool {
        self.inner.connections.read().contains_key(overlay)
    }

    pub fn connected_peers(&self) -> Vec<OverlayAddress> {
        let mut peers: Vec<_> = self.inner.connections.read().keys().copied().collect();
        peers.sort();
        peers
    }

    /// Stores locally uploaded chunks.
    pub fn upload(&self, chunks: &[Chunk]) -> StoreResult<Vec<bool>> {
        self.inner.store.put(ModePut::Upload, chunks)
    }

    /// Attaches a newly connected peer.
    ///
    /// The peer joins the routing table with `capabilities`, which may move
    /// our depth, and gets a session for each protocol it speaks. A peer that
    /// is already connected is detached first.
    pub fn on_peer_connect(
        &self,
        overlay: OverlayAddress,
        capabilities: Capabilities,
        sink: Arc<dyn PeerSink<Message>>,
    ) -> Result<(), NodeError> {
        if self.inner.quit.is_signalled() {
            return Err(NodeError::Stopped);
        }
        if overlay == self.inner.base {
            return Err(NodeError::SelfConnection);
        }
        if self.inner.topology.contains(&overlay) {
            debug!(peer = %overlay, "Peer reconnected, replacing sessions");
            self.detach(&overlay);
        }

        let peer = KademliaPeer {
            overlay,
            capabilities: capabilities.clone(),
        };
        if !self.inner.topology.add(peer) {
            self.inner.metrics.refused_peers.increment(1);
            return Err(NodeError::BinFull {
                peer: overlay,
                po: self.inner.base.proximity(&overlay),
            });
        }
        {
            let mut connections = self.inner.connections.write();
            connections.insert(overlay, sink.clone());
            self.inner
                .metrics
                .connected_peers
                .set(connections.len() as f64);
        }

        if capabilities.contains(&Capability::PullSync) {
            self.inner
                .pullsync
                .add_peer(overlay, Arc::new(ProtocolSink::new(sink.clone())));
        }
        if capabilities.contains(&Capability::Retrieval) {
            self.inner
                .retrieval
                .add_peer(overlay, Arc::new(ProtocolSink::new(sink)));
        }
        info!(
            peer = %overlay,
            po = self.inner.base.proximity(&overlay),
            depth = self.depth(),
            ?capabilities,
            "Peer connected"
        );
        Ok(())
    }

    /// Detaches a disconnected peer. Returns false if it was not connected.
    pub fn on_peer_disconnect(&self, overlay: &OverlayAddress) -> bool {
        let detached = self.detach(overlay);
        if detached {
            info!(peer = %overlay, depth = self.depth(), "Peer disconnected");
        }
        detached
    }

    fn detach(&self, overlay: &OverlayAddress) -> bool {
        let connected = {
            let mut connections = self.inner.connections.write();
            let removed = connections.remove(overlay).is_some();
            self.inner
                .metrics
                .connected_peers
                .set(connections.len() as f64);
            removed
        };
        self.inner.pullsync.remove_peer(overlay);
        self.inner.retrieval.remove_peer(overlay);
        let in_table = self.inner.topology.remove(overlay).is_some();
        connected || in_table
    }

    /// Routes an inbound message to its protocol.
    pub fn handle_message(&self, overlay: &OverlayAddress, msg: Message) {
        match msg {
            Message::Stream(msg) => self.inner.pullsync.handle_message(overlay, msg),
            Message::Retrieval(msg) => self.inner.retrieval.handle_message(overlay, msg),
        }
    }

    /// Drops a peer that sent a frame we cannot decode.
    pub fn on_protocol_error(&self, overlay: &OverlayAddress, err: &CodecError) {
        warn!(peer = %overlay, %err, "Dropping peer after undecodable frame");
        self.inner.metrics.protocol_errors.increment(1);
        let sink = self.inner.connections.read().get(overlay).cloned();
        self.detach(overlay);
        if let Some(sink) = sink {
            sink.disconnect(&format!("protocol error: {err}"));
        }
    }

    /// Fetches a chunk from the local store or the network.
    pub async fn retrieve(&self, address: ChunkAddress) -> RetrievalResult<Chunk> {
        self.inner.retrieval.retrieve(address).await
    }

    /// Sync cursors learned from every connected peer.
    pub fn peer_cursors(&self) -> HashMap<OverlayAddress, HashMap<StreamId, u64>> {
        self.inner.pullsync.peer_cursors()
    }

    /// Stops both protocols and refuses further connections. Idempotent.
    pub async fn stop(&self) {
        self.inner.quit.signal();
        tokio::join!(self.inner.pullsync.stop(), self.inner.retrieval.stop());
        let connections: Vec<_> = self.inner.connections.write().drain().collect();
        for (overlay, sink) in connections {
            self.inner.topology.remove(&overlay);
            sink.disconnect("node stopped");
        }
        self.inner.metrics.connected_peers.set(0.0);
        info!(base = %self.inner.base, "Node stopped");
    }
}
