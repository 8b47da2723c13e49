//! Content-addressed chunks and pull-index descriptors.

use alloy_primitives::keccak256;
use bytes::Bytes;

use crate::{ChunkAddress, MAX_CHUNK_DATA_SIZE};

/// Errors validating a chunk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// Chunk data exceeds [`MAX_CHUNK_DATA_SIZE`].
    #[error("chunk data too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    /// Address does not match the content hash.
    #[error("address mismatch for chunk {address}")]
    AddressMismatch { address: ChunkAddress },
}

/// An immutable chunk: an address plus up to 4096 bytes of payload and an
/// 8 byte span.
///
/// A chunk built with [`Chunk::new`] is not checked; call [`Chunk::verify`]
/// before trusting data received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    address: ChunkAddress,
    data: Bytes,
}

impl Chunk {
    /// Pairs an address with data without validation.
    pub fn new(address: ChunkAddress, data: impl Into<Bytes>) -> Self {
        Self {
            address,
            data: data.into(),
        }
    }

    /// Builds a chunk whose address is derived from its data.
    pub fn from_data(data: impl Into<Bytes>) -> Result<Self, ChunkError> {
        let data = data.into();
        if data.len() > MAX_CHUNK_DATA_SIZE {
            return Err(ChunkError::TooLarge {
                size: data.len(),
                max: MAX_CHUNK_DATA_SIZE,
            });
        }
        Ok(Self {
            address: content_address(&data),
            data,
        })
    }

    pub fn address(&self) -> &ChunkAddress {
        &self.address
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_parts(self) -> (ChunkAddress, Bytes) {
        (self.address, self.data)
    }

    /// Checks the size bound and that the address is the content hash.
    pub fn verify(&self) -> Result<(), ChunkError> {
        if self.data.len() > MAX_CHUNK_DATA_SIZE {
            return Err(ChunkError::TooLarge {
                size: self.data.len(),
                max: MAX_CHUNK_DATA_SIZE,
            });
        }
        if content_address(&self.data) != self.address {
            return Err(ChunkError::AddressMismatch {
                address: self.address,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }
}

fn content_address(data: &[u8]) -> ChunkAddress {
    ChunkAddress::from(keccak256(data))
}

/// A chunk address paired with its position in a pull-index bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub address: ChunkAddress,
    pub bin_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_from_data_is_valid() {
        let chunk = Chunk::from_data(b"hello swarm".to_vec()).unwrap();
        assert!(chunk.is_valid());
        assert_eq!(chunk.data().as_ref(), b"hello swarm");
    }

    #[test]
    fn test_address_mismatch() {
        let good = Chunk::from_data(b"payload".to_vec()).unwrap();
        let forged = Chunk::new(ChunkAddress::new([1u8; 32]), good.data().clone());
        assert_matches!(forged.verify(), Err(ChunkError::AddressMismatch { .. }));
    }

    #[test]
    fn test_too_large() {
        let data = vec![0u8; MAX_CHUNK_DATA_SIZE + 1];
        assert_matches!(Chunk::from_data(data), Err(ChunkError::TooLarge { .. }));
        let data = vec![0u8; MAX_CHUNK_DATA_SIZE];
        assert!(Chunk::from_data(data).is_ok());
    }
}
