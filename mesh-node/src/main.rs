//! Mesh node binary: wires identity, routing, DHT, transports, policy,
//! rate limiting, circuits, and privacy shaping into one running peer.

mod config;
mod error;
mod persistence;

use std::sync::Arc;

use clap::Parser;
use mesh_identity::{CertificatePinStore, TransportType};
use mesh_net::circuit::{CircuitBuilder, CircuitMaintainer};
use mesh_net::dht::DhtStore;
use mesh_net::health::LoggingHealthReporter;
use mesh_net::policy::{PolicyRegistry, PolicyScope, TransportPolicy, TransportSelector};
use mesh_net::rate_limit::{RateLimitConfig, Throttler};
use mesh_net::replay::ReplayCache;
use mesh_net::routing::RoutingTable;
use mesh_net::transport::direct_quic::DirectQuicDialer;
use mesh_net::transport::i2p::I2pSocks5Dialer;
use mesh_net::transport::tor::TorSocks5Dialer;
use mesh_net::transport::Dialer;
use parking_lot::Mutex;
use tokio::time::{interval, Duration};
use tracing::info;

use config::{CliArgs, NodeConfig};
use error::NodeError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Must happen before any rustls/QUIC usage or direct-QUIC dialing panics.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = CliArgs::parse();

    let filter = args
        .log_level
        .as_deref()
        .map(tracing_subscriber::EnvFilter::new)
        .unwrap_or_else(|| {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = NodeConfig::load(&args).await?;
    tokio::fs::create_dir_all(&args.data_dir).await?;

    let node = Node::start(args, config).await?;
    node.run().await
}

struct Node {
    data_dir: std::path::PathBuf,
    dht: Arc<DhtStore>,
    routing: Arc<RoutingTable>,
    selector: Arc<TransportSelector>,
    throttler: Arc<Throttler>,
    replay: Arc<ReplayCache>,
    circuit_maintainer: Arc<CircuitMaintainer>,
    circuit_lifetime_ms: i64,
    circuit_hops: usize,
}

impl Node {
    async fn start(args: CliArgs, config: NodeConfig) -> Result<Self, NodeError> {
        let key_pair = persistence::load_or_generate_identity(&args.data_dir).await?;
        let peer_id = key_pair.peer_id();
        info!(peer_id = %mesh_net::redact::mask_peer_id(peer_id.as_str()), "identity loaded");

        let pins = Arc::new(Mutex::new(
            CertificatePinStore::open(args.data_dir.join("pins.json"))?,
        ));

        let node_id = mesh_crypto::peer_id_raw_bytes(peer_id.as_str())
            .map_err(|e| NodeError::Config(format!("deriving node id: {e}")))?;
        let routing = Arc::new(RoutingTable::new(node_id));

        let dht = Arc::new(DhtStore::new());
        let snapshot_path = args.data_dir.join("dht_snapshot.bin");
        if let Some(records) = persistence::load_dht_snapshot(&snapshot_path).await? {
            let count = records.len();
            dht.restore(records);
            info!(count, "restored DHT snapshot");
        }

        let throttler = Arc::new(Throttler::new(RateLimitConfig::default()));
        let replay = Arc::new(ReplayCache::default());

        let dialers: Vec<(TransportType, Arc<dyn Dialer>)> = vec![
            (TransportType::DirectQuic, Arc::new(DirectQuicDialer::new(pins.clone()))),
            (
                TransportType::TorOnionQuic,
                Arc::new(TorSocks5Dialer::new(config.network.tor_proxy.clone())),
            ),
            (
                TransportType::I2PQuic,
                Arc::new(I2pSocks5Dialer::new(config.network.i2p_proxy.clone())),
            ),
        ];

        let registry = PolicyRegistry::new(vec![TransportPolicy::allow_all(PolicyScope::Global)]);
        let health = Arc::new(LoggingHealthReporter::new());
        let selector = Arc::new(TransportSelector::with_health_reporter(
            registry,
            throttler.clone(),
            dialers,
            health,
        ));

        let circuit_maintainer = Arc::new(CircuitMaintainer::new());

        Ok(Self {
            data_dir: args.data_dir,
            dht,
            routing,
            selector,
            throttler,
            replay,
            circuit_maintainer,
            circuit_lifetime_ms: config.circuit.lifetime_ms,
            circuit_hops: config.circuit.default_hops,
        })
    }

    async fn run(self) -> anyhow::Result<()> {
        info!("mesh node running");
        let mut housekeeping = interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                _ = housekeeping.tick() => self.housekeep(),
                _ = shutdown_signal() => {
                    info!("shutdown signal received, saving state");
                    break;
                }
            }
        }

        let snapshot = self.dht.snapshot();
        persistence::save_dht_snapshot(&self.data_dir.join("dht_snapshot.bin"), &snapshot).await?;
        info!(count = snapshot.len(), "persisted DHT snapshot");
        Ok(())
    }

    fn housekeep(&self) {
        let throttled = self.throttler.sweep();
        let replayed = self.replay.sweep();
        if self.routing.len() >= self.circuit_hops {
            let builder = CircuitBuilder::new(&self.routing, self.circuit_lifetime_ms);
            let target = *self.routing.local_id();
            match self.circuit_maintainer.maintain(&builder, target, self.circuit_hops) {
                Ok(Some(_)) => info!("rebuilt circuit"),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "circuit maintenance failed"),
            }
        }
        info!(
            throttle_buckets_swept = throttled,
            replay_entries_swept = replayed,
            tracked_peers = self.selector.history().tracked_peers(),
            "housekeeping pass complete"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
