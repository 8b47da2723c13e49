//! CLI and config-file arguments for a Swarm node.
//!
//! Each struct is a `clap` argument group and a `serde` table at once, so the
//! same settings can come from flags or from a TOML file:
//!
//! ```toml
//! datadir = "/var/lib/vertex"
//!
//! [pullsync]
//! batch_size = 128
//!
//! [retrieval]
//! search_timeout_ms = 500
//! ```

mod log;
mod pullsync;
mod retrieval;
mod topology;

pub use log::LogArgs;
pub use pullsync::PullsyncArgs;
pub use retrieval::RetrievalArgs;
pub use topology::TopologyArgs;

use std::{path::PathBuf, sync::Arc};

use clap::Args;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use vertex_storage::{MemoryStateStore, StateStore};
use vertex_storage_redb::RedbStateStore;
use vertex_swarm_localstore::LocalStoreArgs;
use vertex_swarm_primitives::OverlayAddress;

use crate::NodeConfig;

/// File name of the interval database inside the data directory.
pub const STATE_DB_FILE: &str = "state.redb";

/// All node settings.
#[derive(Debug, Args, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeArgs {
    /// Directory for persistent protocol state. State is kept in memory when unset.
    #[arg(long = "datadir", value_name = "PATH")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datadir: Option<PathBuf>,

    #[command(flatten)]
    pub log: LogArgs,

    #[command(flatten)]
    pub topology: TopologyArgs,

    #[command(flatten)]
    pub localstore: LocalStoreArgs,

    #[command(flatten)]
    pub pullsync: PullsyncArgs,

    #[command(flatten)]
    pub retrieval: RetrievalArgs,
}

impl NodeArgs {
    /// Parses settings from TOML. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).wrap_err("invalid node configuration")
    }

    /// Reads settings from a TOML file.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    /// The configured overlay address, or a random one.
    pub fn overlay(&self) -> Result<OverlayAddress> {
        match &self.topology.overlay {
            Some(hex) => hex
                .trim_start_matches("0x")
                .parse::<OverlayAddress>()
                .wrap_err_with(|| format!("invalid overlay address {hex}")),
            None => Ok(OverlayAddress::random()),
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            kademlia: self.topology.config(),
            pullsync: self.pullsync.config(),
            retrieval: self.retrieval.config(),
            cache_chunks: self.localstore.cache_chunks,
        }
    }

    /// Opens the interval store: redb under `datadir`, memory otherwise.
    pub fn state_store(&self) -> Result<Arc<dyn StateStore>> {
        let Some(datadir) = &self.datadir else {
            return Ok(Arc::new(MemoryStateStore::new()));
        };
        std::fs::create_dir_all(datadir)
            .wrap_err_with(|| format!("failed to create {}", datadir.display()))?;
        let store = RedbStateStore::open(datadir.join(STATE_DB_FILE))
            .wrap_err("failed to open state database")?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::Duration;
    use vertex_swarm_net_pullsync::PullsyncConfig;
    use vertex_swarm_localstore::DEFAULT_CACHE_CAPACITY;
    use vertex_swarm_net_retrieval::RetrievalConfig;
    use vertex_swarm_topology::KademliaConfig;

    #[derive(Debug, Parser)]
    struct Cli {
        #[command(flatten)]
        args: NodeArgs,
    }

    #[test]
    fn test_defaults_match_crate_configs() {
        let config = NodeArgs::default().node_config();
        assert_eq!(config.pullsync, PullsyncConfig::default());
        assert_eq!(config.retrieval, RetrievalConfig::default());
        assert_eq!(config.kademlia, KademliaConfig::default());
        assert_eq!(config.cache_chunks, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_cli_defaults_match_serde_defaults() {
        let cli = Cli::try_parse_from(["vertex"]).unwrap();
        assert_eq!(cli.args, NodeArgs::default());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "vertex",
            "-vv",
            "--pullsync.batch-size",
            "8",
            "--pullsync.no-autostart",
            "--retrieval.search-timeout",
            "250",
            "--topology.neighbourhood-size",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.args.log.verbosity, 2);

        let config = cli.args.node_config();
        assert_eq!(config.pullsync.batch_size, 8);
        assert!(!config.pullsync.autostart);
        assert_eq!(config.retrieval.search_timeout, Duration::from_millis(250));
        assert_eq!(config.kademlia.min_neighbourhood_size, 4);
    }

    #[test]
    fn test_from_toml_partial() {
        let args = NodeArgs::from_toml_str(
            r#"
            datadir = "/tmp/vertex"

            [pullsync]
            batch_size = 128
            within_depth_only = true
            no_autostart = true

            [retrieval]
            max_hop_count = 4
            "#,
        )
        .unwrap();

        assert_eq!(args.datadir, Some(PathBuf::from("/tmp/vertex")));
        let config = args.node_config();
        assert_eq!(config.pullsync.batch_size, 128);
        assert!(config.pullsync.within_depth_only);
        assert!(!config.pullsync.autostart);
        assert_eq!(config.pullsync.min_frame, PullsyncConfig::default().min_frame);
        assert_eq!(config.retrieval.max_hop_count, 4);
        assert_eq!(
            config.retrieval.search_timeout,
            RetrievalConfig::default().search_timeout
        );
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        assert!(NodeArgs::from_toml_str("[pullsync]\nbatch_size = \"many\"").is_err());
    }

    #[test]
    fn test_overlay() {
        let mut args = NodeArgs::default();
        args.topology.overlay = Some(format!("0x{}", "ab".repeat(32)));
        assert_eq!(args.overlay().unwrap(), OverlayAddress::new([0xab; 32]));

        args.topology.overlay = Some("zz".into());
        assert!(args.overlay().is_err());
    }

    #[test]
    fn test_state_store_in_datadir() {
        let dir = tempfile::tempdir().unwrap();
        let args = NodeArgs {
            datadir: Some(dir.path().join("node")),
            ..Default::default()
        };

        let store = args.state_store().unwrap();
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));
        assert!(dir.path().join("node").join(STATE_DB_FILE).exists());
    }
}
