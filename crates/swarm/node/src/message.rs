//! Per-connection envelope multiplexing the node's protocols.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use vertex_net_codec::{CodecError, WireMessage};
use vertex_swarm_net_pullsync::StreamMessage;
use vertex_swarm_net_retrieval::RetrievalMessage;

const PROTOCOL_STREAM: u8 = 0;
const PROTOCOL_RETRIEVAL: u8 = 1;

/// A message on a peer connection, tagged with its protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Stream(StreamMessage),
    Retrieval(RetrievalMessage),
}

impl Message {
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Stream(_) => "stream",
            Self::Retrieval(_) => "retrieval",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Stream(msg) => msg.name(),
            Self::Retrieval(msg) => msg.name(),
        }
    }
}

impl From<StreamMessage> for Message {
    fn from(msg: StreamMessage) -> Self {
        Self::Stream(msg)
    }
}

impl From<RetrievalMessage> for Message {
    fn from(msg: RetrievalMessage) -> Self {
        Self::Retrieval(msg)
    }
}

impl WireMessage for Message {
    fn encode(&self, dst: &mut BytesMut) {
        match self {
            Self::Stream(msg) => {
                dst.put_u8(PROTOCOL_STREAM);
                msg.encode(dst);
            }
            Self::Retrieval(msg) => {
                dst.put_u8(PROTOCOL_RETRIEVAL);
                msg.encode(dst);
            }
        }
    }

    fn decode(mut src: Bytes) -> Result<Self, CodecError> {
        if !src.has_remaining() {
            return Err(CodecError::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        match src.get_u8() {
            PROTOCOL_STREAM => StreamMessage::decode(src).map(Self::Stream),
            PROTOCOL_RETRIEVAL => RetrievalMessage::decode(src).map(Self::Retrieval),
            id => Err(CodecError::Invalid(format!("unknown protocol id {id}"))),
        }
    }
}
