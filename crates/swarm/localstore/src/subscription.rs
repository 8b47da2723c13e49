use tokio::sync::{mpsc, watch};
use vertex_swarm_primitives::Descriptor;

/// Receiving end of a pull-index subscription.
///
/// Dropping the subscription stops the producer.
#[derive(Debug)]
pub struct PullSubscription {
    descriptors: mpsc::Receiver<Descriptor>,
    stop: watch::Sender<bool>,
}

impl PullSubscription {
    pub(crate) fn new(descriptors: mpsc::Receiver<Descriptor>, stop: watch::Sender<bool>) -> Self {
        Self { descriptors, stop }
    }

    /// Next descriptor, or `None` once the range is exhausted or the
    /// subscription was stopped.
    pub async fn recv(&mut self) -> Option<Descriptor> {
        self.descriptors.recv().await
    }

    /// Stops the producer. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

impl Drop for PullSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
