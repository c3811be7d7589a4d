//! Node configuration: CLI arguments layered over a TOML file, with
//! defaults for every setting so a bare `mesh-node` invocation still runs.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

#[derive(Debug, Parser)]
#[command(name = "mesh-node", about = "Mesh transport and peer-discovery node")]
pub struct CliArgs {
    /// Path to a TOML config file; overrides defaults where present.
    #[arg(long, default_value = "mesh-node.toml")]
    pub config: PathBuf,

    /// Directory for persisted state (DHT snapshot, certificate pins).
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Overrides `network.listen_port` from the config file.
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// `error`, `warn`, `info`, `debug`, or `trace`; falls back to `RUST_LOG`.
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_port: u16,
    pub tor_proxy: String,
    pub i2p_proxy: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 9000,
            tor_proxy: "127.0.0.1:9050".to_string(),
            i2p_proxy: "127.0.0.1:4447".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub default_hops: usize,
    pub lifetime_ms: i64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            default_hops: 3,
            lifetime_ms: 10 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub padding_enabled: bool,
    pub padding_buckets: Vec<usize>,
    pub jitter_enabled: bool,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub batching_enabled: bool,
    pub batch_max_size: usize,
    pub batch_window_ms: u64,
    pub cover_traffic_enabled: bool,
    pub cover_base_ms: u64,
    pub cover_jitter_ms: u64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            padding_enabled: true,
            padding_buckets: vec![256, 1024, 4096, 16384],
            jitter_enabled: true,
            jitter_min_ms: 5,
            jitter_max_ms: 50,
            batching_enabled: true,
            batch_max_size: 16,
            batch_window_ms: 100,
            cover_traffic_enabled: true,
            cover_base_ms: 30_000,
            cover_jitter_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
}

impl NodeConfig {
    /// Loads from `path` if it exists, falling back to defaults; CLI flags
    /// are then applied on top.
    pub async fn load(args: &CliArgs) -> Result<Self, NodeError> {
        let mut config = if args.config.exists() {
            let raw = tokio::fs::read_to_string(&args.config)
                .await
                .map_err(|e| NodeError::Config(format!("reading {}: {e}", args.config.display())))?;
            toml::from_str(&raw).map_err(|e| NodeError::Config(format!("parsing {}: {e}", args.config.display())))?
        } else {
            tracing::info!(path = %args.config.display(), "no config file found, using defaults");
            NodeConfig::default()
        };

        if let Some(port) = args.listen_port {
            config.network.listen_port = port;
        }
        Ok(config)
    }
}
