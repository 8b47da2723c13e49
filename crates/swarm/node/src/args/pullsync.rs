//! Pull-sync CLI arguments.

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use vertex_swarm_net_pullsync::{
    DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT, DEFAULT_CLIENT_BATCH_TIMEOUT, DEFAULT_MIN_FRAME,
    DEFAULT_SYNC_INIT_BACKOFF, PullsyncConfig,
};

const DEFAULT_BATCH_TIMEOUT_MS: u64 = DEFAULT_BATCH_TIMEOUT.as_millis() as u64;
const DEFAULT_CLIENT_BATCH_TIMEOUT_SECS: u64 = DEFAULT_CLIENT_BATCH_TIMEOUT.as_secs();
const DEFAULT_INIT_BACKOFF_MS: u64 = DEFAULT_SYNC_INIT_BACKOFF.as_millis() as u64;

/// Pull-sync configuration.
#[derive(Debug, Args, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[command(next_help_heading = "Pull-sync")]
#[serde(default)]
pub struct PullsyncArgs {
    /// Chunk descriptors offered per range request.
    #[arg(long = "pullsync.batch-size", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Minimum chunks per delivery frame.
    #[arg(long = "pullsync.min-frame", default_value_t = DEFAULT_MIN_FRAME)]
    pub min_frame: usize,

    /// Milliseconds the server waits for more descriptors before closing a batch.
    #[arg(long = "pullsync.batch-timeout", default_value_t = DEFAULT_BATCH_TIMEOUT_MS, value_name = "MS")]
    pub batch_timeout_ms: u64,

    /// Seconds the client waits for a wanted batch to arrive.
    #[arg(long = "pullsync.client-timeout", default_value_t = DEFAULT_CLIENT_BATCH_TIMEOUT_SECS, value_name = "SECS")]
    pub client_batch_timeout_secs: u64,

    /// Milliseconds to wait before subscribing to a new peer's streams.
    #[arg(long = "pullsync.init-backoff", default_value_t = DEFAULT_INIT_BACKOFF_MS, value_name = "MS")]
    pub init_backoff_ms: u64,

    /// Only sync bins within the neighbourhood depth.
    #[arg(long = "pullsync.within-depth")]
    pub within_depth_only: bool,

    /// Learn cursors but do not request ranges automatically.
    #[arg(long = "pullsync.no-autostart")]
    #[serde(rename = "no_autostart")]
    pub disable_autostart: bool,
}

impl Default for PullsyncArgs {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            min_frame: DEFAULT_MIN_FRAME,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
            client_batch_timeout_secs: DEFAULT_CLIENT_BATCH_TIMEOUT_SECS,
            init_backoff_ms: DEFAULT_INIT_BACKOFF_MS,
            within_depth_only: false,
            disable_autostart: false,
        }
    }
}

impl PullsyncArgs {
    pub fn config(&self) -> PullsyncConfig {
        PullsyncConfig {
            batch_size: self.batch_size,
            min_frame: self.min_frame,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            client_batch_timeout: Duration::from_secs(self.client_batch_timeout_secs),
            sync_init_backoff: Duration::from_millis(self.init_backoff_ms),
            within_depth_only: self.within_depth_only,
            autostart: !self.disable_autostart,
            ..Default::default()
        }
    }
}
