//! Stream protocol messages and their wire encoding.
//!
//! Every payload starts with a one byte tag. Tags this node does not know
//! decode to [`StreamMessage::Unknown`] so that newer peers can add
//! messages without breaking older ones.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use vertex_net_codec::{CodecError, WireMessage, WireReader, WireWriter};
use vertex_swarm_primitives::{Chunk, ChunkAddress, HASH_SIZE};

const TAG_STREAM_INFO_REQ: u8 = 0;
const TAG_STREAM_INFO_RES: u8 = 1;
const TAG_GET_RANGE: u8 = 2;
const TAG_OFFERED_HASHES: u8 = 3;
const TAG_WANTED_HASHES: u8 = 4;
const TAG_CHUNK_DELIVERY: u8 = 5;

/// Smallest encoded [`StreamId`]: two empty strings.
const MIN_STREAM_ID_SIZE: usize = 4;

/// Identifies a stream as `(provider name, provider key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub name: String,
    pub key: String,
}

impl StreamId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_string(&self.name);
        dst.put_string(&self.key);
    }

    fn decode(r: &mut WireReader) -> Result<Self, CodecError> {
        Ok(Self {
            name: r.string()?,
            key: r.string()?,
        })
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.name, self.key)
    }
}

/// Asks the server for the cursors of `streams`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfoReq {
    pub streams: Vec<StreamId>,
}

/// Cursor of one stream as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream: StreamId,
    pub cursor: u64,
    /// Bounded streams have no live head.
    pub bounded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfoRes {
    pub streams: Vec<StreamInfo>,
}

/// Requests descriptors of `stream` from `from`, up to `to` inclusive or
/// live when `to` is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRange {
    pub ruid: u32,
    pub stream: StreamId,
    pub from: u64,
    pub to: Option<u64>,
    pub batch_size: u32,
}

/// Concatenated addresses offered for a [`GetRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedHashes {
    pub ruid: u32,
    pub last_index: u64,
    pub hashes: Bytes,
}

impl OfferedHashes {
    /// Splits `hashes` into addresses. `None` if the length is not a
    /// multiple of the hash size.
    pub fn addresses(&self) -> Option<Vec<ChunkAddress>> {
        split_hashes(&self.hashes)
    }
}

/// Bitvector over an offer marking the wanted addresses. Empty means none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedHashes {
    pub ruid: u32,
    pub bitvector: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDelivery {
    pub ruid: u32,
    pub chunks: Vec<Chunk>,
}

/// Any stream protocol message.
#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
pub enum StreamMessage {
    StreamInfoReq(StreamInfoReq),
    StreamInfoRes(StreamInfoRes),
    GetRange(GetRange),
    OfferedHashes(OfferedHashes),
    WantedHashes(WantedHashes),
    ChunkDelivery(ChunkDelivery),
    /// A message with a tag this node does not understand.
    Unknown(u8),
}

impl StreamMessage {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

macro_rules! impl_from_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for StreamMessage {
                fn from(msg: $variant) -> Self {
                    Self::$variant(msg)
                }
            }
        )*
    };
}

impl_from_message!(
    StreamInfoReq,
    StreamInfoRes,
    GetRange,
    OfferedHashes,
    WantedHashes,
    ChunkDelivery,
);

pub(crate) fn split_hashes(hashes: &[u8]) -> Option<Vec<ChunkAddress>> {
    if hashes.len() % HASH_SIZE != 0 {
        return None;
    }
    hashes
        .chunks_exact(HASH_SIZE)
        .map(|h| ChunkAddress::from_slice(h).ok())
        .collect()
}

impl WireMessage for StreamMessage {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::StreamInfoReq(msg) => {
                dst.put_u8(TAG_STREAM_INFO_REQ);
                dst.put_u32(msg.streams.len() as u32);
                for stream in &msg.streams {
                    stream.encode(dst);
                }
            }
            Self::StreamInfoRes(msg) => {
                dst.put_u8(TAG_STREAM_INFO_RES);
                dst.put_u32(msg.streams.len() as u32);
                for info in &msg.streams {
                    info.stream.encode(dst);
                    dst.put_u64(info.cursor);
                    dst.put_bool(info.bounded);
                }
            }
            Self::GetRange(msg) => {
                dst.put_u8(TAG_GET_RANGE);
                dst.put_u32(msg.ruid);
                msg.stream.encode(dst);
                dst.put_u64(msg.from);
                dst.put_opt_u64(msg.to);
                dst.put_u32(msg.batch_size);
            }
            Self::OfferedHashes(msg) => {
                dst.put_u8(TAG_OFFERED_HASHES);
                dst.put_u32(msg.ruid);
                dst.put_u64(msg.last_index);
                dst.put_var_bytes(&msg.hashes);
            }
            Self::WantedHashes(msg) => {
                dst.put_u8(TAG_WANTED_HASHES);
                dst.put_u32(msg.ruid);
                dst.put_var_bytes(&msg.bitvector);
            }
            Self::ChunkDelivery(msg) => {
                dst.put_u8(TAG_CHUNK_DELIVERY);
                dst.put_u32(msg.ruid);
                dst.put_u32(msg.chunks.len() as u32);
                for chunk in &msg.chunks {
                    dst.put_slice(chunk.address().as_bytes());
                    dst.put_var_bytes(chunk.data());
                }
            }
            Self::Unknown(tag) => dst.put_u8(*tag),
        }
    }

    fn decode(src: Bytes) -> Result<Self, CodecError> {
        let mut r = WireReader::new(src);
        let msg = match r.u8()? {
            TAG_STREAM_INFO_REQ => {
                let len = r.list_len(MIN_STREAM_ID_SIZE)?;
                let streams = (0..len)
                    .map(|_| StreamId::decode(&mut r))
                    .collect::<Result<_, _>>()?;
                Self::StreamInfoReq(StreamInfoReq { streams })
            }
            TAG_STREAM_INFO_RES => {
                let len = r.list_len(MIN_STREAM_ID_SIZE + 9)?;
                let streams = (0..len)
                    .map(|_| {
                        Ok(StreamInfo {
                            stream: StreamId::decode(&mut r)?,
                            cursor: r.u64()?,
                            bounded: r.bool()?,
                        })
                    })
                    .collect::<Result<_, CodecError>>()?;
                Self::StreamInfoRes(StreamInfoRes { streams })
            }
            TAG_GET_RANGE => Self::GetRange(GetRange {
                ruid: r.u32()?,
                stream: StreamId::decode(&mut r)?,
                from: r.u64()?,
                to: r.opt_u64()?,
                batch_size: r.u32()?,
            }),
            TAG_OFFERED_HASHES => Self::OfferedHashes(OfferedHashes {
                ruid: r.u32()?,
                last_index: r.u64()?,
                hashes: r.var_bytes()?,
            }),
            TAG_WANTED_HASHES => Self::WantedHashes(WantedHashes {
                ruid: r.u32()?,
                bitvector: r.var_bytes()?,
            }),
            TAG_CHUNK_DELIVERY => {
                let ruid = r.u32()?;
                let len = r.list_len(HASH_SIZE + 4)?;
                let chunks = (0..len)
                    .map(|_| {
                        let address = ChunkAddress::new(r.array::<HASH_SIZE>()?);
                        Ok(Chunk::new(address, r.var_bytes()?))
                    })
                    .collect::<Result<_, CodecError>>()?;
                Self::ChunkDelivery(ChunkDelivery { ruid, chunks })
            }
            // the rest of an unknown message is not ours to interpret
            tag => return Ok(Self::Unknown(tag)),
        };
        r.finish()?;
        Ok(msg)
    }
}
