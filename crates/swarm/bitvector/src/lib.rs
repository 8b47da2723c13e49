//! Fixed-length bit vector.
//!
//! Bit `i` lives in bit `i % 8` of byte `i / 8` (least significant bit
//! first). The byte form is `⌈len / 8⌉` bytes long; padding bits past `len`
//! are always written as zero and ignored when reading.

/// Errors building a [`BitVector`] from bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BitVectorError {
    /// Buffer length does not match the bit length.
    #[error("wrong bitvector length: {len} bits need {expected} bytes, got {actual}")]
    WrongLength {
        len: usize,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitVector {
    len: usize,
    bytes: Vec<u8>,
}

impl BitVector {
    /// Creates a zeroed vector of `len` bits.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: vec![0; byte_len(len)],
        }
    }

    /// Builds a vector of `len` bits from its byte form.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self, BitVectorError> {
        let expected = byte_len(len);
        if bytes.len() != expected {
            return Err(BitVectorError::WrongLength {
                len,
                expected,
                actual: bytes.len(),
            });
        }
        let mut bytes = bytes.to_vec();
        // clear padding so that equal bit sets compare and encode equal
        let tail = len % 8;
        if tail != 0
            && let Some(last) = bytes.last_mut()
        {
            *last &= (1u8 << tail) - 1;
        }
        Ok(Self { len, bytes })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `i`. Out of range indices are ignored.
    pub fn set(&mut self, i: usize) {
        if i < self.len
            && let Some(byte) = self.bytes.get_mut(i / 8)
        {
            *byte |= 1 << (i % 8);
        }
    }

    /// Clears bit `i`. Out of range indices are ignored.
    pub fn unset(&mut self, i: usize) {
        if i < self.len
            && let Some(byte) = self.bytes.get_mut(i / 8)
        {
            *byte &= !(1 << (i % 8));
        }
    }

    /// Returns bit `i`; out of range indices read as unset.
    pub fn get(&self, i: usize) -> bool {
        i < self.len
            && self
                .bytes
                .get(i / 8)
                .is_some_and(|byte| byte & (1 << (i % 8)) != 0)
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.get(i))
    }

    /// Byte form of the vector.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn byte_len(bits: usize) -> usize {
    bits.div_ceil(8)
}
