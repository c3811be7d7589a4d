//! Kademlia Routing Table (C5).
//!
//! Buckets are indexed directly by XOR-distance magnitude (common-prefix
//! length with the local id), one bucket per bit. This gives the same
//! placement a split-on-demand tree would converge to, so the "only the
//! bucket containing the local id may split" rule falls out for free: no
//! other bucket ever aggregates distances that would need splitting.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

pub const NODE_ID_LEN: usize = 20;
pub const K: usize = 20;
pub const NUM_BUCKETS: usize = NODE_ID_LEN * 8;

pub type NodeId = [u8; NODE_ID_LEN];

/// Collaborator consulted before evicting the least-recently-seen entry of
/// a full bucket (§4.5 ping-before-evict).
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, node_id: &NodeId, endpoint: &str) -> bool;
}

/// Probe that reports every peer unreachable. Used where no live dialer is
/// wired in, e.g. a DHT store exercised on its own.
pub struct AlwaysDeadProbe;

#[async_trait]
impl LivenessProbe for AlwaysDeadProbe {
    async fn is_alive(&self, _node_id: &NodeId, _endpoint: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub node_id: NodeId,
    pub endpoint: String,
    pub last_touch: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Bitwise XOR of two node ids, the Kademlia distance metric.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> NodeId {
    let mut out = [0u8; NODE_ID_LEN];
    for i in 0..NODE_ID_LEN {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn leading_zero_bits(distance: &NodeId) -> usize {
    let mut count = 0;
    for byte in distance.iter() {
        if *byte == 0 {
            count += 8;
            continue;
        }
        count += byte.leading_zeros() as usize;
        break;
    }
    count
}

/// Bucket index for a given distance: `NUM_BUCKETS - 1 - leading_zero_bits`,
/// i.e. bucket `i` holds distances in `[2^i, 2^(i+1))`. A zero distance
/// (the local id) maps to bucket 0; callers never insert the local id.
fn bucket_index(distance: &NodeId) -> usize {
    let lz = leading_zero_bits(distance);
    if lz >= NUM_BUCKETS {
        0
    } else {
        NUM_BUCKETS - 1 - lz
    }
}

struct KBucket {
    entries: VecDeque<RoutingEntry>,
}

impl KBucket {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

/// Kademlia routing table over 20-byte node ids (§4.5).
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Mutex<KBucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: (0..NUM_BUCKETS).map(|_| Mutex::new(KBucket::new())).collect(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Update liveness for `node_id`. A full bucket pings its
    /// least-recently-seen entry before evicting it: if it answers, it is
    /// moved to the tail and `node_id` is dropped; if not, it is replaced.
    pub async fn touch(&self, node_id: NodeId, endpoint: String, probe: &dyn LivenessProbe) {
        if node_id == self.local_id {
            return;
        }
        let idx = bucket_index(&xor_distance(&self.local_id, &node_id));
        let now = now_ms();

        let stale_candidate = {
            let mut bucket = self.buckets[idx].lock();
            if let Some(pos) = bucket.entries.iter().position(|e| e.node_id == node_id) {
                let mut entry = bucket.entries.remove(pos).expect("position just located");
                entry.endpoint = endpoint;
                entry.last_touch = now;
                bucket.entries.push_back(entry);
                return;
            }
            if bucket.entries.len() < K {
                bucket.entries.push_back(RoutingEntry {
                    node_id,
                    endpoint,
                    last_touch: now,
                });
                return;
            }
            bucket.entries.front().cloned()
        };

        let Some(candidate) = stale_candidate else {
            return;
        };
        let alive = probe.is_alive(&candidate.node_id, &candidate.endpoint).await;

        let mut bucket = self.buckets[idx].lock();
        if alive {
            if let Some(pos) = bucket.entries.iter().position(|e| e.node_id == candidate.node_id) {
                if let Some(mut entry) = bucket.entries.remove(pos) {
                    entry.last_touch = now_ms();
                    bucket.entries.push_back(entry);
                }
            }
        } else {
            bucket.entries.retain(|e| e.node_id != candidate.node_id);
            if bucket.entries.len() < K {
                bucket.entries.push_back(RoutingEntry {
                    node_id,
                    endpoint,
                    last_touch: now_ms(),
                });
            }
        }
    }

    /// The `n` entries closest to `target` by ascending XOR distance, ties
    /// broken by more recent `last_touch`.
    pub fn get_closest(&self, target: &NodeId, n: usize) -> Vec<RoutingEntry> {
        let mut all: Vec<RoutingEntry> = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.lock().entries.iter().cloned());
        }
        all.sort_by(|a, b| {
            let da = xor_distance(target, &a.node_id);
            let db = xor_distance(target, &b.node_id);
            da.cmp(&db).then_with(|| b.last_touch.cmp(&a.last_touch))
        });
        all.truncate(n);
        all
    }

    pub fn remove(&self, node_id: &NodeId) {
        let idx = bucket_index(&xor_distance(&self.local_id, node_id));
        self.buckets[idx].lock().entries.retain(|e| &e.node_id != node_id);
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
