use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, watch},
    time::timeout,
};
use vertex_net_codec::SendError;
use vertex_swarm_localstore::MemoryChunkStore;
use vertex_swarm_topology::{Kademlia, KademliaConfig, KademliaPeer};

use super::*;
use crate::DEFAULT_MAX_HOP_COUNT;

type TestRetrieval = Retrieval<Arc<MemoryChunkStore>, Arc<Kademlia>>;

struct TestSink {
    tx: mpsc::UnboundedSender<RetrievalMessage>,
    dropped: watch::Sender<Option<String>>,
}

#[async_trait]
impl PeerSink<RetrievalMessage> for TestSink {
    async fn send(&self, msg: RetrievalMessage) -> Result<(), SendError> {
        self.tx.send(msg).map_err(|_| SendError::Disconnected)
    }

    fn disconnect(&self, reason: &str) {
        self.dropped.send_replace(Some(reason.to_owned()));
    }
}

/// The remote end of a connection to the node under test.
struct Remote {
    overlay: OverlayAddress,
    rx: mpsc::UnboundedReceiver<RetrievalMessage>,
    dropped: watch::Receiver<Option<String>>,
}

impl Remote {
    async fn next(&mut self) -> RetrievalMessage {
        timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("no message in time")
            .expect("sink closed")
    }

    async fn next_request(&mut self) -> RetrieveRequest {
        assert_matches!(self.next().await, RetrievalMessage::RetrieveRequest(r) => r)
    }

    async fn assert_silent(&mut self, wait: Duration) {
        assert_matches!(timeout(wait, self.rx.recv()).await, Err(_));
    }

    async fn wait_dropped(&self) -> String {
        let mut dropped = self.dropped.clone();
        timeout(Duration::from_secs(5), dropped.wait_for(|d| d.is_some()))
            .await
            .expect("peer not dropped in time")
            .expect("sink gone")
            .clone()
            .unwrap()
    }
}

struct Node {
    retrieval: TestRetrieval,
    store: Arc<MemoryChunkStore>,
    kademlia: Arc<Kademlia>,
}

impl Node {
    fn new(config: RetrievalConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let base = OverlayAddress::ZERO;
        let store = Arc::new(MemoryChunkStore::new(base));
        let kademlia = Arc::new(Kademlia::new(base, KademliaConfig::default()));
        Self {
            retrieval: Retrieval::new(store.clone(), kademlia.clone(), config),
            store,
            kademlia,
        }
    }

    fn connect(&self, overlay: OverlayAddress) -> Remote {
        let (tx, rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped) = watch::channel(None);
        self.kademlia.add(KademliaPeer::full(overlay));
        self.retrieval.add_peer(
            overlay,
            Arc::new(TestSink {
                tx,
                dropped: dropped_tx,
            }),
        );
        Remote {
            overlay,
            rx,
            dropped,
        }
    }

    fn spawn_retrieve(&self, address: ChunkAddress) -> tokio::task::JoinHandle<RetrievalResult<Chunk>> {
        let retrieval = self.retrieval.clone();
        tokio::spawn(async move { retrieval.retrieve(address).await })
    }

    fn deliver(&self, from: &Remote, ruid: u32, chunk: &Chunk) {
        self.retrieval.handle_message(
            &from.overlay,
            RetrievalMessage::ChunkDelivery(ChunkDelivery {
                ruid,
                address: *chunk.address(),
                data: chunk.data().clone(),
            }),
        );
    }
}

fn fast_config() -> RetrievalConfig {
    RetrievalConfig {
        search_timeout: Duration::from_millis(50),
        global_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Address starting with `prefix`, zero-padded.
fn address(prefix: &[u8]) -> ChunkAddress {
    let mut bytes = [0u8; 32];
    bytes[..prefix.len()].copy_from_slice(prefix);
    ChunkAddress::new(bytes)
}

fn chunk(data: &str) -> Chunk {
    Chunk::from_data(data.as_bytes().to_vec()).unwrap()
}

async fn join(handle: tokio::task::JoinHandle<RetrievalResult<Chunk>>) -> RetrievalResult<Chunk> {
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("fetch did not finish")
        .unwrap()
}

#[tokio::test]
async fn test_local_chunk_needs_no_peers() {
    let node = Node::new(fast_config());
    let chunk = chunk("local");
    node.store
        .put(ModePut::Upload, std::slice::from_ref(&chunk))
        .unwrap();
    assert_eq!(node.retrieval.retrieve(*chunk.address()).await.unwrap(), chunk);
}

#[tokio::test]
async fn test_no_peers_is_no_suitable_peer() {
    let node = Node::new(fast_config());
    assert_matches!(
        node.retrieval.retrieve(*chunk("nowhere").address()).await,
        Err(RetrievalError::NoSuitablePeer)
    );
}

#[tokio::test]
async fn test_origin_closer_is_refused() {
    let node = Node::new(fast_config());
    let _peer = node.connect(address(&[0xf0]));
    let request = Request {
        address: address(&[0xff]),
        origin: Some(address(&[0xfe])),
        hop_count: 1,
    };
    let skip = SkipSet::new(Duration::from_secs(10));
    assert_matches!(
        node.retrieval.find_peer(&request, &skip),
        Err(RetrievalError::OriginCloser)
    );
}

#[tokio::test]
async fn test_neighbourhood_request_needs_progress_over_origin() {
    let node = Node::new(fast_config());
    let target = address(&[0x00, 0x00, 0xff]);
    let origin = address(&[0x00, 0x01]);
    let _origin = node.connect(origin);
    let _further = node.connect(address(&[0x00, 0x02]));
    let skip = SkipSet::new(Duration::from_secs(10));

    let request = Request {
        address: target,
        origin: Some(origin),
        hop_count: 1,
    };
    assert_matches!(
        node.retrieval.find_peer(&request, &skip),
        Err(RetrievalError::NoSuitablePeer)
    );

    let closer = address(&[0x00, 0x00, 0xf0]);
    let _closer = node.connect(closer);
    assert_eq!(node.retrieval.find_peer(&request, &skip).unwrap(), closer);
}

#[tokio::test]
async fn test_find_peer_prefers_closest_and_rotates_within_bin() {
    let node = Node::new(fast_config());
    let target = address(&[0xff; 32]);
    let far = address(&[0x80]);
    let near_a = address(&[0xf0]);
    let near_b = address(&[0xf1]);
    for overlay in [far, near_a, near_b] {
        let _ = node.connect(overlay);
    }
    let request = Request::local(target);
    let mut skip = SkipSet::new(Duration::from_secs(10));

    let picks: Vec<_> = (0..3)
        .map(|_| node.retrieval.find_peer(&request, &skip).unwrap())
        .collect();
    assert_eq!(picks, vec![near_a, near_b, near_a]);

    skip.insert(near_a);
    skip.insert(near_b);
    assert_eq!(node.retrieval.find_peer(&request, &skip).unwrap(), far);
}

#[tokio::test]
async fn test_request_and_delivery() {
    let node = Node::new(fast_config());
    let mut remote = node.connect(address(&[0x80]));
    let chunk = chunk("remote");

    let fetch = node.spawn_retrieve(*chunk.address());
    let request = remote.next_request().await;
    assert_eq!(request.address, *chunk.address());
    assert_eq!(request.hop_count, 0);

    node.deliver(&remote, request.ruid, &chunk);
    assert_eq!(join(fetch).await.unwrap(), chunk);
    assert!(node.store.has(chunk.address()).unwrap());
    assert_eq!(node.retrieval.peer(&remote.overlay).unwrap().retrievals_len(), 0);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_request() {
    let node = Node::new(RetrievalConfig {
        search_timeout: Duration::from_secs(2),
        ..fast_config()
    });
    let mut remote = node.connect(address(&[0x80]));
    let chunk = chunk("shared");

    let first = node.spawn_retrieve(*chunk.address());
    let second = node.spawn_retrieve(*chunk.address());
    let request = remote.next_request().await;
    remote.assert_silent(Duration::from_millis(50)).await;

    node.deliver(&remote, request.ruid, &chunk);
    assert_eq!(join(first).await.unwrap(), chunk);
    assert_eq!(join(second).await.unwrap(), chunk);
}

#[tokio::test]
async fn test_unsolicited_delivery_drops_peer() {
    let node = Node::new(fast_config());
    let remote = node.connect(address(&[0x80]));
    node.deliver(&remote, 1, &chunk("unasked"));

    let reason = remote.wait_dropped().await;
    assert!(reason.contains("unsolicited"), "{reason}");
    assert!(node.retrieval.peer(&remote.overlay).is_none());
}

#[tokio::test]
async fn test_delivery_of_other_address_drops_peer() {
    let node = Node::new(RetrievalConfig {
        search_timeout: Duration::from_secs(2),
        ..fast_config()
    });
    let mut remote = node.connect(address(&[0x80]));
    let wanted = chunk("wanted");

    let fetch = node.spawn_retrieve(*wanted.address());
    let request = remote.next_request().await;
    node.deliver(&remote, request.ruid, &chunk("something else"));

    remote.wait_dropped().await;
    assert!(!node.store.has(wanted.address()).unwrap());
    fetch.abort();
}

#[tokio::test]
async fn test_next_peer_after_search_timeout() {
    let node = Node::new(fast_config());
    let mut one = node.connect(address(&[0x80]));
    let mut two = node.connect(address(&[0x40]));
    let chunk = chunk("second try");

    let fetch = node.spawn_retrieve(*chunk.address());
    let (first, mut second) = tokio::select! {
        _ = one.rx.recv() => (one, two),
        _ = two.rx.recv() => (two, one),
    };
    let request = second.next_request().await;
    node.deliver(&second, request.ruid, &chunk);
    assert_eq!(join(fetch).await.unwrap(), chunk);

    // the late answer of the first peer is no longer expected
    node.deliver(&first, request.ruid, &chunk);
    first.wait_dropped().await;
}

#[tokio::test]
async fn test_fetch_deadline() {
    let node = Node::new(RetrievalConfig {
        search_timeout: Duration::from_secs(1),
        global_timeout: Duration::from_millis(100),
        ..fast_config()
    });
    let _remote = node.connect(address(&[0x80]));
    let address = *chunk("slow").address();
    assert_matches!(
        node.retrieval.retrieve(address).await,
        Err(RetrievalError::DeadlineExceeded(a)) if a == address
    );
}

#[tokio::test]
async fn test_chunk_stored_meanwhile_resolves_fetch() {
    let node = Node::new(fast_config());
    let mut remote = node.connect(address(&[0x80]));
    let chunk = chunk("synced");

    let fetch = node.spawn_retrieve(*chunk.address());
    remote.next_request().await;
    node.store
        .put(ModePut::Sync, std::slice::from_ref(&chunk))
        .unwrap();
    assert_eq!(join(fetch).await.unwrap(), chunk);
}

#[tokio::test]
async fn test_serves_request_from_store() {
    let node = Node::new(fast_config());
    let mut remote = node.connect(address(&[0x80]));
    let chunk = chunk("served");
    node.store
        .put(ModePut::Upload, std::slice::from_ref(&chunk))
        .unwrap();

    node.retrieval.handle_message(
        &remote.overlay,
        RetrievalMessage::RetrieveRequest(RetrieveRequest {
            ruid: 5,
            address: *chunk.address(),
            hop_count: 0,
        }),
    );
    assert_eq!(
        remote.next().await,
        RetrievalMessage::ChunkDelivery(ChunkDelivery {
            ruid: 5,
            address: *chunk.address(),
            data: Bytes::copy_from_slice(chunk.data()),
        })
    );
}

#[tokio::test]
async fn test_forwarded_request_carries_next_hop() {
    let node = Node::new(fast_config());
    let target = address(&[0x00, 0x00, 0xff]);
    let mut origin = node.connect(address(&[0x00, 0x01]));
    let mut closer = node.connect(address(&[0x00, 0x00, 0xf0]));

    node.retrieval.handle_message(
        &origin.overlay,
        RetrievalMessage::RetrieveRequest(RetrieveRequest {
            ruid: 9,
            address: target,
            hop_count: 2,
        }),
    );
    let forwarded = closer.next_request().await;
    assert_eq!(forwarded.address, target);
    assert_eq!(forwarded.hop_count, 3);
    origin.assert_silent(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_hop_limit_is_refused() {
    let node = Node::new(fast_config());
    let mut origin = node.connect(address(&[0x80]));
    let mut other = node.connect(address(&[0x40]));

    node.retrieval.handle_message(
        &origin.overlay,
        RetrievalMessage::RetrieveRequest(RetrieveRequest {
            ruid: 1,
            address: *chunk("far away").address(),
            hop_count: DEFAULT_MAX_HOP_COUNT,
        }),
    );
    other.assert_silent(Duration::from_millis(100)).await;
    origin.assert_silent(Duration::from_millis(10)).await;
    assert!(origin.dropped.borrow().is_none());
}

#[tokio::test]
async fn test_stop_cancels_fetches() {
    let node = Node::new(RetrievalConfig {
        search_timeout: Duration::from_secs(5),
        global_timeout: Duration::from_secs(10),
        ..fast_config()
    });
    let mut remote = node.connect(address(&[0x80]));
    let fetch = node.spawn_retrieve(*chunk("pending").address());
    remote.next_request().await;

    node.retrieval.stop().await;
    node.retrieval.stop().await;
    assert_matches!(join(fetch).await, Err(RetrievalError::Shutdown));
    assert_eq!(node.retrieval.peer_count(), 0);
}
