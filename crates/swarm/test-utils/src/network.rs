//! In-process connections between nodes.
//!
//! Every message crosses the connection as a length-delimited frame produced
//! by [`ProtocolCodec`], so tests exercise the same encoding a socket would.
//! Either side closing a connection tears down both directions and notifies
//! both ends.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use asynchronous_codec::{Decoder, Encoder};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use vertex_net_codec::{
    CodecError, DEFAULT_MAX_MESSAGE_SIZE, PeerSink, ProtocolCodec, SendError,
};
use vertex_swarm_node::{Message, Node};
use vertex_swarm_primitives::OverlayAddress;
use vertex_swarm_topology::{Capabilities, Capability};
use vertex_tasks::{Shutdown, ShutdownSignal};

/// Both protocols.
pub fn full_capabilities() -> Capabilities {
    [Capability::PullSync, Capability::Retrieval].into()
}

/// Connections between [`Node`]s and scripted [`RawPeer`]s. Cheap to clone.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    max_message_size: usize,
    links: Mutex<HashMap<LinkKey, Link>>,
}

type LinkKey = (OverlayAddress, OverlayAddress);

fn link_key(a: OverlayAddress, b: OverlayAddress) -> LinkKey {
    if a <= b { (a, b) } else { (b, a) }
}

struct Link {
    quit: Shutdown,
    ends: [(OverlayAddress, Endpoint); 2],
}

#[derive(Clone)]
enum Endpoint {
    Node(Node),
    Raw(Arc<RawState>),
}

impl Endpoint {
    fn overlay(&self) -> OverlayAddress {
        match self {
            Self::Node(node) => node.base(),
            Self::Raw(raw) => raw.overlay,
        }
    }

    fn deliver(&self, from: &OverlayAddress, msg: Message) {
        match self {
            Self::Node(node) => node.handle_message(from, msg),
            Self::Raw(raw) => {
                let _ = raw.inbox.send(msg);
            }
        }
    }

    fn protocol_error(&self, from: &OverlayAddress, err: &CodecError) {
        match self {
            Self::Node(node) => node.on_protocol_error(from, err),
            Self::Raw(raw) => raw.set_disconnected(format!("protocol error: {err}")),
        }
    }

    fn disconnected(&self, remote: &OverlayAddress, reason: &str) {
        match self {
            Self::Node(node) => {
                node.on_peer_disconnect(remote);
            }
            Self::Raw(raw) => raw.set_disconnected(reason.to_owned()),
        }
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl MemoryNetwork {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_message_size,
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Connects two nodes speaking both protocols.
    pub fn connect(&self, a: &Node, b: &Node) {
        self.connect_with(a, b, full_capabilities());
    }

    /// Connects two nodes that advertise `capabilities` to each other.
    ///
    /// # Panics
    ///
    /// If either node refuses the connection.
    pub fn connect_with(&self, a: &Node, b: &Node, capabilities: Capabilities) {
        let (a_end, b_end) = (Endpoint::Node(a.clone()), Endpoint::Node(b.clone()));
        let quit = self.open_link(a_end.clone(), b_end.clone());
        let to_b = self.open_pipe(a.base(), b_end, quit.clone());
        let to_a = self.open_pipe(b.base(), a_end, quit);

        if let Err(err) = a.on_peer_connect(b.base(), capabilities.clone(), to_b) {
            panic!("{} refused {}: {err}", a.base(), b.base());
        }
        if let Err(err) = b.on_peer_connect(a.base(), capabilities, to_a) {
            panic!("{} refused {}: {err}", b.base(), a.base());
        }
    }

    /// Connects a scripted peer at `overlay` to `node`.
    ///
    /// # Panics
    ///
    /// If the node refuses the connection.
    pub fn connect_raw(&self, node: &Node, overlay: OverlayAddress) -> RawPeer {
        let (inbox, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RawState {
            overlay,
            inbox,
            disconnected: watch::channel(None).0,
        });
        let raw_end = Endpoint::Raw(state.clone());
        let node_end = Endpoint::Node(node.clone());
        let quit = self.open_link(node_end.clone(), raw_end.clone());
        let to_node = self.open_pipe(overlay, node_end, quit.clone());
        let to_raw = self.open_pipe(node.base(), raw_end, quit);

        if let Err(err) = node.on_peer_connect(overlay, full_capabilities(), to_raw) {
            panic!("{} refused raw peer {overlay}: {err}", node.base());
        }
        RawPeer {
            state,
            remote: node.base(),
            sink: to_node,
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Closes the connection between `a` and `b`, notifying both ends.
    /// Returns false if they were not connected.
    pub fn disconnect(&self, a: &OverlayAddress, b: &OverlayAddress, reason: &str) -> bool {
        let Some(link) = self.inner.links.lock().remove(&link_key(*a, *b)) else {
            return false;
        };
        link.quit.signal();
        debug!(%a, %b, reason, "Connection closed");
        let [(first, first_end), (second, second_end)] = &link.ends;
        first_end.disconnected(second, reason);
        second_end.disconnected(first, reason);
        true
    }

    pub fn is_connected(&self, a: &OverlayAddress, b: &OverlayAddress) -> bool {
        self.inner.links.lock().contains_key(&link_key(*a, *b))
    }

    pub fn connection_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    fn open_link(&self, a: Endpoint, b: Endpoint) -> ShutdownSignal {
        let (a_overlay, b_overlay) = (a.overlay(), b.overlay());
        let key = link_key(a_overlay, b_overlay);
        // a redial replaces the previous connection without notifying
        let link = Link {
            quit: Shutdown::new(),
            ends: [(a_overlay, a), (b_overlay, b)],
        };
        let quit = link.quit.subscribe();
        if let Some(old) = self.inner.links.lock().insert(key, link) {
            old.quit.signal();
        }
        quit
    }

    /// Starts the reader for frames sent by `from` to `to` and returns the
    /// sending half.
    fn open_pipe(
        &self,
        from: OverlayAddress,
        to: Endpoint,
        quit: ShutdownSignal,
    ) -> Arc<FrameSink> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let max_message_size = self.inner.max_message_size;
        let quit_reader = quit.clone();
        let remote = to.overlay();
        tokio::spawn(async move {
            let mut codec = ProtocolCodec::<Message>::new(max_message_size);
            let mut buf = BytesMut::new();
            loop {
                let bytes = tokio::select! {
                    bytes = rx.recv() => bytes,
                    _ = quit_reader.wait() => None,
                };
                let Some(bytes) = bytes else {
                    return;
                };
                buf.extend_from_slice(&bytes);
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(msg)) => {
                            trace!(%from, to = %remote, msg = msg.name(), "Frame delivered");
                            to.deliver(&from, msg);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            to.protocol_error(&from, &err);
                            return;
                        }
                    }
                }
            }
        });

        Arc::new(FrameSink {
            network: Arc::downgrade(&self.inner),
            local: from,
            remote,
            max_message_size,
            tx,
            quit,
        })
    }
}

/// Outbound half of one direction of a connection.
pub struct FrameSink {
    network: Weak<Inner>,
    local: OverlayAddress,
    remote: OverlayAddress,
    max_message_size: usize,
    tx: mpsc::UnboundedSender<Bytes>,
    quit: ShutdownSignal,
}

impl FrameSink {
    /// Writes raw bytes to the connection, bypassing the encoder.
    pub fn send_bytes(&self, bytes: Bytes) -> Result<(), SendError> {
        if self.quit.is_signalled() {
            return Err(SendError::Disconnected);
        }
        self.tx.send(bytes).map_err(|_| SendError::Disconnected)
    }
}

#[async_trait]
impl PeerSink<Message> for FrameSink {
    async fn send(&self, msg: Message) -> Result<(), SendError> {
        let mut frame = BytesMut::new();
        ProtocolCodec::<Message>::new(self.max_message_size)
            .encode(&msg, &mut frame)
            .map_err(|e| SendError::Encode(e.to_string()))?;
        self.send_bytes(frame.freeze())
    }

    fn disconnect(&self, reason: &str) {
        if let Some(inner) = self.network.upgrade() {
            MemoryNetwork { inner }.disconnect(&self.local, &self.remote, reason);
        }
    }
}

struct RawState {
    overlay: OverlayAddress,
    inbox: mpsc::UnboundedSender<Message>,
    disconnected: watch::Sender<Option<String>>,
}

impl RawState {
    fn set_disconnected(&self, reason: String) {
        self.disconnected.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }
}

/// A scripted peer: the test sends whatever it likes and reads what the node
/// sends back.
pub struct RawPeer {
    state: Arc<RawState>,
    remote: OverlayAddress,
    sink: Arc<FrameSink>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl RawPeer {
    pub fn overlay(&self) -> OverlayAddress {
        self.state.overlay
    }

    /// Overlay of the node this peer is connected to.
    pub fn remote(&self) -> OverlayAddress {
        self.remote
    }

    pub async fn send(&self, msg: impl Into<Message>) -> Result<(), SendError> {
        self.sink.send(msg.into()).await
    }

    /// Sends `payload` framed with a length prefix but otherwise unchecked.
    pub fn send_payload(&self, payload: &[u8]) -> Result<(), SendError> {
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.extend_from_slice(payload);
        self.sink.send_bytes(frame.freeze())
    }

    /// Next message from the node, if one arrives within `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Option<Message> {
        let mut inbox = self.inbox.lock().await;
        tokio::time::timeout(timeout, inbox.recv()).await.ok().flatten()
    }

    /// Disconnect reason, once the connection has been closed.
    pub fn disconnect_reason(&self) -> Option<String> {
        self.state.disconnected.borrow().clone()
    }

    /// Waits up to `timeout` for the connection to close.
    pub async fn wait_disconnected(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.state.disconnected.subscribe();
        let closed = tokio::time::timeout(timeout, rx.wait_for(|reason| reason.is_some())).await;
        match closed {
            Ok(Ok(reason)) => reason.clone(),
            _ => None,
        }
    }

    /// Closes the connection from this side.
    pub fn close(&self) {
        self.sink.disconnect("closed by raw peer");
    }
}
