//! Circuit Builder (§4.12): multi-hop circuits assembled from the routing
//! table, with periodic maintenance and proactive rebuild.
//!
//! No teacher precedent exists for multi-hop circuit construction in this
//! codebase (its "circuit" hits are zero-knowledge proof circuits, an
//! unrelated concept); this module follows the established in-crate idiom
//! (`thiserror` errors, `tracing` at decision points, `DashMap`-backed
//! shared state) rather than a literal teacher adaptation.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::routing::{NodeId, RoutingTable};

pub const MIN_HOPS: usize = 2;
pub const MAX_HOPS: usize = 6;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Coarse stand-in for network-neighborhood diversity: the node id's
/// leading byte. Real topology hints (ASN, subnet) are supplied by the
/// caller-side peer descriptor and aren't modeled here.
fn neighborhood(id: &NodeId) -> u8 {
    id[0]
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitError {
    #[error("hop count {0} is outside the allowed range [{MIN_HOPS}, {MAX_HOPS}]")]
    InvalidHopCount(usize),
    #[error("routing table has only {available} peer(s), need {needed}")]
    InsufficientPeers { available: usize, needed: usize },
}

#[derive(Debug, Clone)]
pub struct CircuitDescriptor {
    pub id: String,
    pub target: NodeId,
    pub hops: Vec<NodeId>,
    pub built_at: i64,
    pub expires_at: i64,
}

impl CircuitDescriptor {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Builds circuits from the routing table's closest-peers view, preferring
/// hops from distinct neighborhoods when enough diversity is available.
pub struct CircuitBuilder<'a> {
    routing: &'a RoutingTable,
    lifetime_ms: i64,
}

impl<'a> CircuitBuilder<'a> {
    pub fn new(routing: &'a RoutingTable, lifetime_ms: i64) -> Self {
        Self { routing, lifetime_ms }
    }

    pub fn build(&self, target: NodeId, hops: usize) -> Result<CircuitDescriptor, CircuitError> {
        if !(MIN_HOPS..=MAX_HOPS).contains(&hops) {
            return Err(CircuitError::InvalidHopCount(hops));
        }

        let pool = self.routing.get_closest(&target, self.routing.len());
        if pool.len() < hops {
            return Err(CircuitError::InsufficientPeers {
                available: pool.len(),
                needed: hops,
            });
        }

        let mut selected = Vec::with_capacity(hops);
        let mut used_neighborhoods = HashSet::new();

        // First pass: prefer peers from neighborhoods not yet represented.
        for entry in &pool {
            if selected.len() == hops {
                break;
            }
            let n = neighborhood(&entry.node_id);
            if used_neighborhoods.insert(n) {
                selected.push(entry.node_id);
            }
        }

        // Second pass: fill any remaining slots regardless of neighborhood.
        if selected.len() < hops {
            for entry in &pool {
                if selected.len() == hops {
                    break;
                }
                if !selected.contains(&entry.node_id) {
                    selected.push(entry.node_id);
                }
            }
        }

        let built_at = now_ms();
        let id = hex::encode(&target[..4]) + "-" + &built_at.to_string();
        info!(hops, "built circuit");
        Ok(CircuitDescriptor {
            id,
            target,
            hops: selected,
            built_at,
            expires_at: built_at + self.lifetime_ms,
        })
    }
}

/// Tracks live circuits and tears down/rebuilds them over time.
#[derive(Default)]
pub struct CircuitMaintainer {
    circuits: DashMap<String, CircuitDescriptor>,
}

impl CircuitMaintainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, descriptor: CircuitDescriptor) {
        self.circuits.insert(descriptor.id.clone(), descriptor);
    }

    pub fn active_count(&self) -> usize {
        self.circuits.len()
    }

    /// Removes expired circuits; returns how many were torn down.
    pub fn sweep(&self, now: i64) -> usize {
        let before = self.circuits.len();
        self.circuits.retain(|_, c| !c.is_expired(now));
        before - self.circuits.len()
    }

    /// Proactively rebuilds a circuit to `target` when no circuits are
    /// active and the routing table has enough peers to support `hops`.
    pub fn maintain(
        &self,
        builder: &CircuitBuilder,
        target: NodeId,
        hops: usize,
    ) -> Result<Option<CircuitDescriptor>, CircuitError> {
        self.sweep(now_ms());
        if self.active_count() > 0 {
            return Ok(None);
        }
        match builder.build(target, hops) {
            Ok(descriptor) => {
                self.insert(descriptor.clone());
                Ok(Some(descriptor))
            }
            Err(CircuitError::InsufficientPeers { available, needed }) => {
                warn!(available, needed, "not enough peers to rebuild circuit");
                Err(CircuitError::InsufficientPeers { available, needed })
            }
            Err(e) => Err(e),
        }
    }
}
