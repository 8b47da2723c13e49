//! Overlay and chunk addresses.

use core::{cmp::Ordering, fmt, str::FromStr};

use alloy_primitives::{B256, hex};

use crate::{EXTENDED_PO, HASH_SIZE, MAX_PO, distance_cmp, proximity};

/// Errors constructing an address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// Input was not exactly [`HASH_SIZE`] bytes.
    #[error("invalid address length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Input was not valid hex.
    #[error("invalid hex address: {0}")]
    InvalidHex(String),
}

/// A 256-bit position in the Swarm address space.
///
/// Nodes (overlay addresses) and chunks (content addresses) share the same
/// space, which is what makes proximity between them meaningful.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SwarmAddress(pub B256);

/// Address of a chunk.
pub type ChunkAddress = SwarmAddress;

/// Overlay address of a node.
pub type OverlayAddress = SwarmAddress;

impl SwarmAddress {
    /// The all-zero address.
    pub const ZERO: Self = Self(B256::ZERO);

    /// Creates an address from raw bytes.
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(B256::new(bytes))
    }

    /// Creates an address from a slice, checking the length.
    pub fn from_slice(slice: &[u8]) -> Result<Self, AddressError> {
        let bytes: [u8; HASH_SIZE] =
            slice
                .try_into()
                .map_err(|_| AddressError::InvalidLength {
                    expected: HASH_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self::new(bytes))
    }

    /// Generates a random address.
    #[cfg(feature = "rand")]
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    /// Raw bytes of the address.
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0.0
    }

    /// Proximity order to `other`, capped at [`MAX_PO`].
    pub fn proximity(&self, other: &Self) -> u8 {
        proximity(self.as_bytes(), other.as_bytes(), MAX_PO)
    }

    /// Proximity order to `other` with full precision.
    pub fn extended_proximity(&self, other: &Self) -> u8 {
        proximity(self.as_bytes(), other.as_bytes(), EXTENDED_PO)
    }

    /// Compares `x` and `y` by distance to `self`. See [`distance_cmp`].
    pub fn distance_cmp(&self, x: &Self, y: &Self) -> Ordering {
        distance_cmp(self.as_bytes(), x.as_bytes(), y.as_bytes())
    }

    /// Returns true if `self` is strictly closer to `target` than `other`.
    pub fn closer(&self, target: &Self, other: &Self) -> bool {
        target.distance_cmp(self, other) == Ordering::Greater
    }

    /// Full lowercase hex representation, without prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl From<[u8; HASH_SIZE]> for SwarmAddress {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self::new(bytes)
    }
}

impl From<B256> for SwarmAddress {
    fn from(value: B256) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for SwarmAddress {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl FromStr for SwarmAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| AddressError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

// Short form for logs: the first 8 bytes are enough to tell peers apart.
impl fmt::Display for SwarmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0.0[..8]))
    }
}

impl fmt::Debug for SwarmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwarmAddress({})", self.to_hex())
    }
}

impl fmt::LowerHex for SwarmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn addr(first: u8, second: u8) -> SwarmAddress {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[0] = first;
        bytes[1] = second;
        SwarmAddress::new(bytes)
    }

    #[test]
    fn test_from_slice_length() {
        assert_matches!(
            SwarmAddress::from_slice(&[0u8; 31]),
            Err(AddressError::InvalidLength { expected: 32, actual: 31 })
        );
        assert!(SwarmAddress::from_slice(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_proximity_is_symmetric_and_capped() {
        let a = addr(0b1010_0000, 0);
        let b = addr(0b1011_0000, 0);
        assert_eq!(a.proximity(&b), 3);
        assert_eq!(b.proximity(&a), 3);
        assert_eq!(a.proximity(&a), MAX_PO);
        assert_eq!(a.extended_proximity(&a), EXTENDED_PO);
    }

    #[test]
    fn test_proximity_transitivity() {
        // po(a,b) = 5 and po(b,c) = 9 imply po(a,c) = 5
        let a = addr(0b0000_0100, 0);
        let b = addr(0b0000_0000, 0b0000_0000);
        let c = addr(0b0000_0000, 0b0100_0000);
        let (ab, bc, ac) = (a.proximity(&b), b.proximity(&c), a.proximity(&c));
        assert_eq!(ab, 5);
        assert_eq!(bc, 9);
        assert_eq!(ac, ab.min(bc));
    }

    #[test]
    fn test_closer() {
        let target = addr(0x91, 0);
        let near = addr(0x82, 0);
        let far = addr(0x12, 0);
        assert!(near.closer(&target, &far));
        assert!(!far.closer(&target, &near));
        assert!(!near.closer(&target, &near));
    }

    #[test]
    fn test_hex_roundtrip_and_display() {
        let a = addr(0xab, 0xcd);
        let parsed: SwarmAddress = a.to_hex().parse().unwrap();
        assert_eq!(parsed, a);
        assert_eq!(a.to_string(), "abcd000000000000");
    }
}
