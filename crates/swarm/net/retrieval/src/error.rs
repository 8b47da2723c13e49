use vertex_net_codec::SendError;
use vertex_swarm_localstore::StoreError;
use vertex_swarm_primitives::ChunkAddress;

/// Errors of the retrieval protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrievalError {
    /// No connected peer is closer to the chunk in a way that makes progress.
    #[error("no suitable peer")]
    NoSuitablePeer,

    /// The requesting peer is closer to the chunk than we are.
    #[error("origin is closer to the chunk than this node")]
    OriginCloser,

    #[error("fetch of {0} timed out")]
    DeadlineExceeded(ChunkAddress),

    #[error("request for {address} exceeded {hops} hops")]
    HopLimit { address: ChunkAddress, hops: u8 },

    /// A delivery we never asked for, or for another address.
    #[error("unsolicited delivery of {address} with ruid {ruid}")]
    Unsolicited { ruid: u32, address: ChunkAddress },

    #[error("invalid chunk delivered: {0}")]
    InvalidChunk(StoreError),

    #[error("chunk store: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("shutting down")]
    Shutdown,
}

impl RetrievalError {
    /// Errors for which the peer is disconnected.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unsolicited { .. } | Self::InvalidChunk(_))
    }
}

impl From<StoreError> for RetrievalError {
    fn from(err: StoreError) -> Self {
        if err.is_invalid_chunk() {
            Self::InvalidChunk(err)
        } else {
            Self::Store(err)
        }
    }
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;
