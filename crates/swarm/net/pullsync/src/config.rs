use std::time::Duration;

/// Descriptors offered per [`GetRange`](crate::GetRange).
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Lower bound on chunks per delivery frame.
pub const DEFAULT_MIN_FRAME: usize = 16;

/// Server wait for the next descriptor before closing a batch.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(500);

/// Client wait for a wanted batch to be delivered.
pub const DEFAULT_CLIENT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before a new peer's first subscription.
pub const DEFAULT_SYNC_INIT_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound on how long [`Registry::stop`](crate::Registry::stop) waits.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Pull-sync configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullsyncConfig {
    pub batch_size: usize,
    pub min_frame: usize,
    pub batch_timeout: Duration,
    pub client_batch_timeout: Duration,
    pub sync_init_backoff: Duration,
    /// Only sync bins at or beyond our depth.
    pub within_depth_only: bool,
    /// Request ranges as soon as a cursor is learned.
    pub autostart: bool,
    pub stop_timeout: Duration,
}

impl Default for PullsyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            min_frame: DEFAULT_MIN_FRAME,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            client_batch_timeout: DEFAULT_CLIENT_BATCH_TIMEOUT,
            sync_init_backoff: DEFAULT_SYNC_INIT_BACKOFF,
            within_depth_only: false,
            autostart: true,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl PullsyncConfig {
    /// Chunks per [`ChunkDelivery`](crate::ChunkDelivery) frame.
    pub fn frame_size(&self) -> usize {
        self.min_frame.max(self.batch_size / 4).max(1)
    }

    /// Batch size actually used, at least one.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}
