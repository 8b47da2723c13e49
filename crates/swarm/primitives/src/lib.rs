//! Core primitive types shared by the sync and retrieval crates.
//!
//! Kept separate from the protocol crates so that the chunk store, the
//! topology and both wire protocols agree on addresses and chunks without
//! depending on one another.

mod address;
mod chunk;
mod proximity;

pub use address::{AddressError, ChunkAddress, OverlayAddress, SwarmAddress};
pub use chunk::{Chunk, ChunkError, Descriptor};
pub use proximity::{distance_cmp, proximity};

/// Size in bytes of an address (overlay or chunk).
pub const HASH_SIZE: usize = 32;

/// Highest proximity order used for binning. Bins are `0..=MAX_PO`.
pub const MAX_PO: u8 = 16;

/// Proximity cap used when the full 256-bit precision is needed.
pub const EXTENDED_PO: u8 = u8::MAX;

/// Number of bins in the pull index and routing table.
pub const NUM_BINS: usize = MAX_PO as usize + 1;

/// Maximum payload of a chunk, excluding the span.
pub const CHUNK_SIZE: usize = 4096;

/// Size of the span prefix carried in chunk data.
pub const SPAN_SIZE: usize = 8;

/// Upper bound on the length of chunk data on the wire and in the store.
pub const MAX_CHUNK_DATA_SIZE: usize = CHUNK_SIZE + SPAN_SIZE;
