//! Outbound half of a peer connection as seen by protocol handlers.

use async_trait::async_trait;

/// Errors returned when a message cannot be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection is gone.
    #[error("peer disconnected")]
    Disconnected,

    /// The message could not be framed.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Sends typed messages to one connected peer.
///
/// Implementations own the framing and the transport. Handlers serialize
/// their own sends; a sink only has to be safe to share.
#[async_trait]
pub trait PeerSink<M: Send + 'static>: Send + Sync {
    async fn send(&self, msg: M) -> Result<(), SendError>;

    /// Requests that the connection be closed.
    fn disconnect(&self, reason: &str);
}
