//! Big-endian field encoding.
//!
//! Strings carry a `u16` length, byte strings and lists a `u32` length,
//! optional integers a one byte presence flag.

use bytes::{Buf, BufMut, Bytes};

use crate::CodecError;

/// Field writers for any [`BufMut`].
pub trait WireWriter: BufMut {
    /// Writes a `u16` length-prefixed UTF-8 string. Longer strings are cut
    /// at the last char boundary that fits.
    fn put_string(&mut self, s: &str) {
        let mut end = s.len().min(u16::MAX as usize);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = s.as_bytes().get(..end).unwrap_or_default();
        self.put_u16(end as u16);
        self.put_slice(bytes);
    }

    /// Writes a `u32` length-prefixed byte string.
    fn put_var_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_slice(bytes);
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_opt_u64(&mut self, value: Option<u64>) {
        match value {
            Some(v) => {
                self.put_u8(1);
                self.put_u64(v);
            }
            None => self.put_u8(0),
        }
    }
}

impl<B: BufMut + ?Sized> WireWriter for B {}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        self.ensure(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::Invalid(format!("bool byte {other}"))),
        }
    }

    pub fn opt_u64(&mut self) -> Result<Option<u64>, CodecError> {
        match self.bool()? {
            true => self.u64().map(Some),
            false => Ok(None),
        }
    }

    /// Reads exactly `N` raw bytes.
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Reads a `u32` length-prefixed byte string without copying.
    pub fn var_bytes(&mut self) -> Result<Bytes, CodecError> {
        let len = self.u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u16()? as usize;
        self.ensure(len)?;
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Reads a `u32` list length, checking that `len` items of at least
    /// `min_item_size` bytes can still follow.
    pub fn list_len(&mut self, min_item_size: usize) -> Result<usize, CodecError> {
        let len = self.u32()? as usize;
        self.ensure(len.saturating_mul(min_item_size))?;
        Ok(len)
    }

    /// Fails if unread bytes remain.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.buf.remaining() {
            0 => Ok(()),
            remaining => Err(CodecError::TrailingBytes { remaining }),
        }
    }
}
