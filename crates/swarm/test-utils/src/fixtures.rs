//! Chunks, addresses and configs for multi-node tests.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing_subscriber::EnvFilter;
use vertex_swarm_net_pullsync::PullsyncConfig;
use vertex_swarm_net_retrieval::RetrievalConfig;
use vertex_swarm_node::NodeConfig;
use vertex_swarm_primitives::{Chunk, HASH_SIZE, SwarmAddress};

/// Installs a test-writer subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Node settings with timers short enough for tests.
pub fn test_config() -> NodeConfig {
    NodeConfig {
        pullsync: PullsyncConfig {
            batch_timeout: Duration::from_millis(50),
            client_batch_timeout: Duration::from_secs(2),
            sync_init_backoff: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        retrieval: RetrievalConfig {
            search_timeout: Duration::from_millis(200),
            global_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A content-addressed chunk with random payload.
pub fn random_chunk() -> Chunk {
    let mut rng = rand::rng();
    let len = rng.random_range(1..=512);
    let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
    match Chunk::from_data(data) {
        Ok(chunk) => chunk,
        Err(err) => panic!("random payload does not fit a chunk: {err}"),
    }
}

pub fn random_chunks(n: usize) -> Vec<Chunk> {
    (0..n).map(|_| random_chunk()).collect()
}

/// The address equal to `target` except for bit `po`, so that its proximity
/// to `target` is exactly `po` (for `po < MAX_PO`).
pub fn address_at_po(target: &SwarmAddress, po: u8) -> SwarmAddress {
    let mut bytes = *target.as_bytes();
    let index = usize::from(po / 8) % HASH_SIZE;
    if let Some(byte) = bytes.get_mut(index) {
        *byte ^= 0x80 >> (po % 8);
    }
    SwarmAddress::new(bytes)
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    poll_until(timeout, move || {
        let ok = condition();
        async move { ok }
    })
    .await
}

/// Async flavour of [`eventually`].
pub async fn poll_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vertex_swarm_primitives::MAX_PO;

    #[test]
    fn test_address_at_po() {
        let target = SwarmAddress::random();
        for po in 0..MAX_PO {
            assert_eq!(target.proximity(&address_at_po(&target, po)), po);
        }
    }

    #[test]
    fn test_random_chunks_are_valid() {
        assert!(random_chunks(8).iter().all(Chunk::is_valid));
    }
}
