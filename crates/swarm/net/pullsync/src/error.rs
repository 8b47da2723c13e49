use vertex_net_codec::SendError;
use vertex_swarm_bitvector::BitVectorError;
use vertex_swarm_intervals::IntervalError;
use vertex_swarm_localstore::StoreError;
use vertex_swarm_primitives::ChunkAddress;

/// Errors raised while handling stream protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unknown stream provider {0:?}")]
    UnknownProvider(String),

    #[error("unknown ruid {0}")]
    UnknownRuid(u32),

    #[error("invalid stream key {0:?}")]
    InvalidKey(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unsolicited chunk {0}")]
    Unsolicited(ChunkAddress),

    #[error("invalid chunk delivered: {0}")]
    InvalidChunk(StoreError),

    #[error("batch {ruid} not delivered in time")]
    BatchTimeout { ruid: u32 },

    #[error(transparent)]
    BitVector(#[from] BitVectorError),

    #[error("chunk store: {0}")]
    Store(StoreError),

    #[error("interval store: {0}")]
    Intervals(#[from] IntervalError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("shutting down")]
    Shutdown,
}

impl SyncError {
    /// Whether the error is the peer's fault and the connection must be
    /// dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownProvider(_)
                | Self::UnknownRuid(_)
                | Self::InvalidKey(_)
                | Self::Protocol(_)
                | Self::Unsolicited(_)
                | Self::InvalidChunk(_)
                | Self::BatchTimeout { .. }
                | Self::BitVector(_)
        )
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        if err.is_invalid_chunk() {
            Self::InvalidChunk(err)
        } else {
            Self::Store(err)
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use vertex_swarm_primitives::ChunkError;

    #[test]
    fn test_store_errors_split_by_blame() {
        let invalid: SyncError = StoreError::InvalidChunk(ChunkError::AddressMismatch {
            address: ChunkAddress::ZERO,
        })
        .into();
        assert_matches!(invalid, SyncError::InvalidChunk(_));
        assert!(invalid.is_fatal());

        let transient: SyncError = StoreError::Database("closed".into()).into();
        assert_matches!(transient, SyncError::Store(_));
        assert!(!transient.is_fatal());
        assert!(!SyncError::Shutdown.is_fatal());
    }
}
