//! Framing shared by the vertex wire protocols.
//!
//! A frame is a big-endian `u32` payload length followed by the payload.
//! [`ProtocolCodec`] wraps any [`WireMessage`] in that framing and enforces
//! a maximum payload size on both encode and decode.

mod sink;
mod wire;

pub use sink::{PeerSink, SendError};
pub use wire::{WireReader, WireWriter};

use std::{io, marker::PhantomData};

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum payload size accepted by default (10 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{remaining} trailing bytes after message")]
    TrailingBytes { remaining: usize },

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("invalid message: {0}")]
    Invalid(String),
}

/// A message with a self-describing binary payload.
pub trait WireMessage: Sized {
    fn encode(&self, dst: &mut BytesMut);

    fn decode(src: Bytes) -> Result<Self, CodecError>;
}

/// Length-delimited codec for a [`WireMessage`].
#[derive(Debug)]
pub struct ProtocolCodec<M> {
    max_message_size: usize,
    _message: PhantomData<fn() -> M>,
}

impl<M> ProtocolCodec<M> {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            _message: PhantomData,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl<M> Default for ProtocolCodec<M> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl<M> Clone for ProtocolCodec<M> {
    fn clone(&self) -> Self {
        Self::new(self.max_message_size)
    }
}

impl<M: WireMessage + 'static> Encoder for ProtocolCodec<M> {
    type Item<'a> = &'a M;
    type Error = CodecError;

    fn encode(&mut self, item: Self::Item<'_>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut payload = BytesMut::new();
        item.encode(&mut payload);
        if payload.len() > self.max_message_size {
            return Err(CodecError::FrameTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }
        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl<M: WireMessage> Decoder for ProtocolCodec<M> {
    type Item = M;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(prefix) = src.get(..LENGTH_PREFIX) else {
            return Ok(None);
        };
        let mut prefix = prefix;
        let size = prefix.get_u32() as usize;
        if size > self.max_message_size {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        if src.len() < LENGTH_PREFIX + size {
            src.reserve(LENGTH_PREFIX + size - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(size).freeze();
        M::decode(payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[derive(Debug, PartialEq)]
    struct Ping {
        nonce: u64,
        note: String,
    }

    impl WireMessage for Ping {
        fn encode(&self, dst: &mut BytesMut) {
            dst.put_u64(self.nonce);
            dst.put_string(&self.note);
        }

        fn decode(src: Bytes) -> Result<Self, CodecError> {
            let mut r = WireReader::new(src);
            let msg = Ping {
                nonce: r.u64()?,
                note: r.string()?,
            };
            r.finish()?;
            Ok(msg)
        }
    }

    fn ping() -> Ping {
        Ping {
            nonce: 7,
            note: "hi".into(),
        }
    }

    #[test]
    fn test_partial_frames() {
        let mut codec = ProtocolCodec::<Ping>::default();
        let mut buf = BytesMut::new();
        codec.encode(&ping(), &mut buf).unwrap();
        codec.encode(&ping(), &mut buf).unwrap();

        let full = buf.split().freeze();
        let mut input = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in full.iter() {
            input.put_u8(*byte);
            while let Some(msg) = codec.decode(&mut input).unwrap() {
                decoded.push(msg);
            }
        }
        assert_eq!(decoded, vec![ping(), ping()]);
        assert!(input.is_empty());
    }

    fn frame<M: WireMessage + 'static>(msg: &M) -> BytesMut {
        let mut buf = BytesMut::new();
        ProtocolCodec::<M>::default().encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_generic_frame_layout() {
        let buf = frame(&ping());
        // nonce, then a u16-prefixed note
        assert_eq!(buf.get(..4), Some(&[0, 0, 0, 12][..]));
        assert_eq!(buf.len(), 4 + 12);
        let decoded = ProtocolCodec::<Ping>::default()
            .decode(&mut buf.clone())
            .unwrap();
        assert_eq!(decoded, Some(ping()));
    }

    #[test]
    fn test_encode_rejects_oversized() {
        let mut codec = ProtocolCodec::<Ping>::new(8);
        let mut buf = BytesMut::new();
        assert_matches!(
            codec.encode(&ping(), &mut buf),
            Err(CodecError::FrameTooLarge { size: 12, max: 8 })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let mut codec = ProtocolCodec::<Ping>::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        assert_matches!(codec.decode(&mut buf), Err(CodecError::FrameTooLarge { size: 17, .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut codec = ProtocolCodec::<Ping>::default();
        let mut buf = BytesMut::new();
        buf.put_u32(11);
        buf.put_u64(1);
        buf.put_string("");
        buf.put_u8(0);
        assert_matches!(codec.decode(&mut buf), Err(CodecError::TrailingBytes { remaining: 1 }));
    }
}
