//! Protocol views of a connection sink.

use std::{marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use vertex_net_codec::{PeerSink, SendError};

use crate::Message;

/// Narrows a connection's [`Message`] sink to the messages of one protocol.
pub(crate) struct ProtocolSink<M> {
    inner: Arc<dyn PeerSink<Message>>,
    _protocol: PhantomData<fn(M)>,
}

impl<M> ProtocolSink<M> {
    pub(crate) fn new(inner: Arc<dyn PeerSink<Message>>) -> Self {
        Self {
            inner,
            _protocol: PhantomData,
        }
    }
}

#[async_trait]
impl<M> PeerSink<M> for ProtocolSink<M>
where
    M: Into<Message> + Send + 'static,
{
    async fn send(&self, msg: M) -> Result<(), SendError> {
        self.inner.send(msg.into()).await
    }

    fn disconnect(&self, reason: &str) {
        self.inner.disconnect(reason);
    }
}
