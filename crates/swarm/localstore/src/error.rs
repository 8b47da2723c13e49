use vertex_swarm_primitives::{ChunkAddress, ChunkError};

/// Errors from chunk store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The chunk failed validation.
    #[error("invalid chunk: {0}")]
    InvalidChunk(#[from] ChunkError),

    /// Chunk not found.
    #[error("chunk not found: {0}")]
    NotFound(ChunkAddress),

    /// Bin index out of range.
    #[error("invalid bin {0}")]
    InvalidBin(u8),

    /// Backend failure.
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Invalid chunks are the peer's fault; everything else is ours.
    pub fn is_invalid_chunk(&self) -> bool {
        matches!(self, Self::InvalidChunk(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
