//! Retrieval protocol messages.

use bytes::{BufMut, Bytes, BytesMut};
use vertex_net_codec::{CodecError, WireMessage, WireReader, WireWriter};
use vertex_swarm_primitives::{ChunkAddress, HASH_SIZE};

const TAG_RETRIEVE_REQUEST: u8 = 0;
const TAG_CHUNK_DELIVERY: u8 = 1;

/// Asks a peer for the chunk at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub ruid: u32,
    pub address: ChunkAddress,
    /// Forwarding hops this request has already taken.
    pub hop_count: u8,
}

/// Answer to a [`RetrieveRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDelivery {
    pub ruid: u32,
    pub address: ChunkAddress,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
pub enum RetrievalMessage {
    RetrieveRequest(RetrieveRequest),
    ChunkDelivery(ChunkDelivery),
}

impl RetrievalMessage {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

impl From<RetrieveRequest> for RetrievalMessage {
    fn from(msg: RetrieveRequest) -> Self {
        Self::RetrieveRequest(msg)
    }
}

impl From<ChunkDelivery> for RetrievalMessage {
    fn from(msg: ChunkDelivery) -> Self {
        Self::ChunkDelivery(msg)
    }
}

impl WireMessage for RetrievalMessage {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::RetrieveRequest(msg) => {
                dst.put_u8(TAG_RETRIEVE_REQUEST);
                dst.put_u32(msg.ruid);
                dst.put_slice(msg.address.as_bytes());
                dst.put_u8(msg.hop_count);
            }
            Self::ChunkDelivery(msg) => {
                dst.put_u8(TAG_CHUNK_DELIVERY);
                dst.put_u32(msg.ruid);
                dst.put_slice(msg.address.as_bytes());
                dst.put_var_bytes(&msg.data);
            }
        }
    }

    fn decode(src: Bytes) -> Result<Self, CodecError> {
        let mut r = WireReader::new(src);
        let msg = match r.u8()? {
            TAG_RETRIEVE_REQUEST => Self::RetrieveRequest(RetrieveRequest {
                ruid: r.u32()?,
                address: ChunkAddress::new(r.array::<HASH_SIZE>()?),
                hop_count: r.u8()?,
            }),
            TAG_CHUNK_DELIVERY => Self::ChunkDelivery(ChunkDelivery {
                ruid: r.u32()?,
                address: ChunkAddress::new(r.array::<HASH_SIZE>()?),
                data: r.var_bytes()?,
            }),
            tag => return Err(CodecError::UnknownTag(tag)),
        };
        r.finish()?;
        Ok(msg)
    }
}
