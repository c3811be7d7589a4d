//! NAT Traversal (C6): STUN-style classification and a bounded
//! direct-dial → hole-punch → relay connection sequence.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatClass {
    Direct,
    FullCone,
    Restricted,
    Symmetric,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMethod {
    DirectDial,
    HolePunch,
    Relay,
}

#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub method: ConnectMethod,
    pub endpoint: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NatError {
    #[error("direct dial, hole punch, and relay all failed or timed out for {target}")]
    Unreachable { target: String },
}

/// A STUN-capable classifier: probes a well-known server to determine how
/// this node's NAT maps outbound UDP traffic.
#[async_trait]
pub trait StunClient: Send + Sync {
    async fn classify(&self) -> NatClass;
}

/// Attempts a plain outbound dial to `target`, e.g. a direct QUIC connect.
#[async_trait]
pub trait DirectDialer: Send + Sync {
    async fn dial(&self, target: &str) -> bool;
}

/// Coordinates a synchronized UDP hole-punch attempt with a peer, typically
/// brokered through a rendezvous/introducer.
#[async_trait]
pub trait HolePuncher: Send + Sync {
    async fn punch(&self, target: &str) -> bool;
}

/// Dials `target` indirectly through a known relay peer.
#[async_trait]
pub trait RelayDialer: Send + Sync {
    async fn relay(&self, target: &str) -> bool;
}

pub struct NatTraversal {
    pub direct_deadline: Duration,
    pub punch_deadline: Duration,
    pub relay_deadline: Duration,
}

impl Default for NatTraversal {
    fn default() -> Self {
        Self {
            direct_deadline: Duration::from_secs(5),
            punch_deadline: Duration::from_secs(8),
            relay_deadline: Duration::from_secs(10),
        }
    }
}

impl NatTraversal {
    /// Try, in order and each under its own deadline: direct dial, UDP
    /// hole-punch, relay. Returns the method that succeeded so the caller
    /// can feed it back into per-transport health scoring (§4.6).
    pub async fn connect(
        &self,
        target: &str,
        direct: &dyn DirectDialer,
        punch: &dyn HolePuncher,
        relay: &dyn RelayDialer,
    ) -> Result<ConnectOutcome, NatError> {
        if with_deadline(self.direct_deadline, direct.dial(target)).await {
            info!(target, method = "direct", "nat traversal succeeded");
            return Ok(ConnectOutcome {
                method: ConnectMethod::DirectDial,
                endpoint: target.to_string(),
            });
        }

        if with_deadline(self.punch_deadline, punch.punch(target)).await {
            info!(target, method = "hole_punch", "nat traversal succeeded");
            return Ok(ConnectOutcome {
                method: ConnectMethod::HolePunch,
                endpoint: target.to_string(),
            });
        }

        if with_deadline(self.relay_deadline, relay.relay(target)).await {
            info!(target, method = "relay", "nat traversal succeeded");
            return Ok(ConnectOutcome {
                method: ConnectMethod::Relay,
                endpoint: target.to_string(),
            });
        }

        warn!(target, "direct dial, hole punch, and relay all failed");
        Err(NatError::Unreachable {
            target: target.to_string(),
        })
    }
}

async fn with_deadline(deadline: Duration, fut: impl std::future::Future<Output = bool>) -> bool {
    tokio::time::timeout(deadline, fut).await.unwrap_or(false)
}
