//! DHT Store (C5): key/value storage with TTL and a per-key replica cap.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_TTL_SECS: u64 = 60;
pub const MAX_REPLICAS_PER_KEY: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DhtError {
    #[error("ttl must be at least {min} seconds, got {got}")]
    TtlTooShort { min: u64, got: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhtRecord {
    pub key: [u8; 20],
    pub value: Vec<u8>,
    pub stored_at: i64,
    pub ttl_secs: u64,
}

impl DhtRecord {
    fn expires_at(&self) -> i64 {
        self.stored_at + self.ttl_secs as i64 * 1000
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Replicated key/value store with TTL expiry (§4.5). Per-key replicas are
/// capped; once at capacity the oldest-stored replica is evicted to make
/// room. Expired records are removed lazily on access and by `sweep`.
#[derive(Default)]
pub struct DhtStore {
    records: DashMap<[u8; 20], Vec<DhtRecord>>,
}

impl DhtStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: [u8; 20], value: Vec<u8>, ttl_secs: u64) -> Result<(), DhtError> {
        if ttl_secs < MIN_TTL_SECS {
            return Err(DhtError::TtlTooShort {
                min: MIN_TTL_SECS,
                got: ttl_secs,
            });
        }
        let now = now_ms();
        let record = DhtRecord {
            key,
            value,
            stored_at: now,
            ttl_secs,
        };

        let mut replicas = self.records.entry(key).or_default();
        replicas.retain(|r| !r.is_expired(now));
        if replicas.len() >= MAX_REPLICAS_PER_KEY {
            if let Some((oldest_idx, _)) = replicas
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.stored_at)
            {
                replicas.remove(oldest_idx);
            }
        }
        replicas.push(record);
        Ok(())
    }

    /// Any non-expired values stored for `key`. Lazily drops expired
    /// replicas encountered along the way.
    pub fn get(&self, key: &[u8; 20]) -> Vec<Vec<u8>> {
        let now = now_ms();
        let Some(mut replicas) = self.records.get_mut(key) else {
            return Vec::new();
        };
        replicas.retain(|r| !r.is_expired(now));
        replicas.iter().map(|r| r.value.clone()).collect()
    }

    /// Remove all expired records across all keys; drops keys left empty.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let mut removed = 0;
        let mut empty_keys = Vec::new();
        for mut entry in self.records.iter_mut() {
            let before = entry.len();
            entry.retain(|r| !r.is_expired(now));
            removed += before - entry.len();
            if entry.is_empty() {
                empty_keys.push(*entry.key());
            }
        }
        for key in empty_keys {
            self.records.remove(&key);
        }
        removed
    }

    pub fn replica_count(&self, key: &[u8; 20]) -> usize {
        self.records.get(key).map(|r| r.len()).unwrap_or(0)
    }

    /// All non-expired records, for persisting to disk between restarts.
    pub fn snapshot(&self) -> Vec<DhtRecord> {
        let now = now_ms();
        self.records
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|r| !r.is_expired(now))
            .collect()
    }

    /// Restores records from a prior [`snapshot`](Self::snapshot), dropping
    /// any that have since expired.
    pub fn restore(&self, records: Vec<DhtRecord>) {
        let now = now_ms();
        for record in records {
            if record.is_expired(now) {
                continue;
            }
            self.records.entry(record.key).or_default().push(record);
        }
    }
}
