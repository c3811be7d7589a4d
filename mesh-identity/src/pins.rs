//! Certificate Pin Store (C4).
//!
//! Per-peer SPKI pin state with trust-on-first-use, rotation into a
//! "previous" set, and disk persistence. Updates are serialized per peer
//! id via the backing `DashMap`'s shard locking (§5).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use mesh_crypto::mask_peer_id as mask;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

const PREVIOUS_PIN_TTL_SECS: i64 = 30 * 24 * 3600;
const PEER_INACTIVITY_TTL_SECS: i64 = 90 * 24 * 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PinError {
    #[error("certificate SPKI does not match any current or valid previous pin")]
    Mismatch,
    #[error("failed to persist pin store: {0}")]
    Persistence(String),
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// Per-peer pin state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerCertificateInfo {
    pub current_pins: HashSet<String>,
    pub previous_pins: HashSet<String>,
    pub last_rotation: i64,
    pub last_validation: i64,
}

/// SHA-256(SPKI), base64-encoded.
pub fn compute_pin(spki_der: &[u8]) -> String {
    let digest = Sha256::digest(spki_der);
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, digest)
}

#[derive(Default, Serialize, Deserialize)]
struct PinStoreState {
    peers: std::collections::HashMap<String, PeerCertificateInfo>,
}

/// Per-peer SPKI pin state, persisted to disk as JSON (§4.4, §6).
pub struct CertificatePinStore {
    peers: DashMap<String, PeerCertificateInfo>,
    path: Option<PathBuf>,
}

impl CertificatePinStore {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            path: None,
        }
    }

    /// Load from `path` if it exists, otherwise start empty; subsequent
    /// mutations persist back to `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PinError> {
        let path = path.as_ref().to_path_buf();
        let peers = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| PinError::Persistence(e.to_string()))?;
            let state: PinStoreState =
                serde_json::from_slice(&bytes).map_err(|e| PinError::Persistence(e.to_string()))?;
            let map = DashMap::new();
            for (k, v) in state.peers {
                map.insert(k, v);
            }
            map
        } else {
            DashMap::new()
        };
        Ok(Self {
            peers,
            path: Some(path),
        })
    }

    fn persist(&self) -> Result<(), PinError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut peers = std::collections::HashMap::new();
        for entry in self.peers.iter() {
            peers.insert(entry.key().clone(), entry.value().clone());
        }
        let state = PinStoreState { peers };
        let bytes =
            serde_json::to_vec_pretty(&state).map_err(|e| PinError::Persistence(e.to_string()))?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &bytes).map_err(|e| PinError::Persistence(e.to_string()))?;
        std::fs::rename(&tmp_path, path).map_err(|e| PinError::Persistence(e.to_string()))?;
        Ok(())
    }

    /// Validate a presented certificate's SPKI for `peer_id` (§4.4 steps 1-5).
    pub fn validate(&mut self, peer_id: &str, computed_pin: &str) -> Result<(), PinError> {
        let now = now_secs();
        let mut entry = self.peers.entry(peer_id.to_string()).or_default();

        if entry.current_pins.is_empty() && entry.previous_pins.is_empty() {
            info!(peer = %mask(peer_id), "trust-on-first-use: accepting first observed pin");
            entry.current_pins.insert(computed_pin.to_string());
            entry.last_rotation = now;
            entry.last_validation = now;
            drop(entry);
            return self.persist();
        }

        if entry.current_pins.contains(computed_pin) {
            entry.last_validation = now;
            drop(entry);
            return self.persist();
        }

        if entry.previous_pins.contains(computed_pin) && now - entry.last_rotation < PREVIOUS_PIN_TTL_SECS {
            info!(peer = %mask(peer_id), "accepting pin from previous rotation window");
            entry.last_validation = now;
            drop(entry);
            return self.persist();
        }

        warn!(peer = %mask(peer_id), "certificate pin mismatch: possible MITM");
        Err(PinError::Mismatch)
    }

    /// Add/rotate a pin for `peer_id`: demotes any existing current pins
    /// to previous and records the new current pin.
    pub fn add_pin(&mut self, peer_id: &str, pin: &str) -> Result<(), PinError> {
        let now = now_secs();
        {
            let mut entry = self.peers.entry(peer_id.to_string()).or_default();
            let demoted: Vec<String> = entry.current_pins.drain().collect();
            entry.previous_pins.extend(demoted);
            entry.current_pins.insert(pin.to_string());
            entry.last_rotation = now;
        }
        self.persist()
    }

    /// Remove previous pins older than 30 days, and peers with no pins and
    /// no validation activity for 90 days.
    pub fn cleanup(&mut self) -> Result<(), PinError> {
        let now = now_secs();
        let mut to_remove = Vec::new();
        for mut entry in self.peers.iter_mut() {
            if now - entry.last_rotation >= PREVIOUS_PIN_TTL_SECS {
                entry.previous_pins.clear();
            }
            if entry.current_pins.is_empty()
                && entry.previous_pins.is_empty()
                && now - entry.last_validation >= PEER_INACTIVITY_TTL_SECS
            {
                to_remove.push(entry.key().clone());
            }
        }
        for peer_id in to_remove {
            self.peers.remove(&peer_id);
        }
        self.persist()
    }

    pub fn info_for(&self, peer_id: &str) -> Option<PeerCertificateInfo> {
        self.peers.get(peer_id).map(|e| e.clone())
    }
}

impl Default for CertificatePinStore {
    fn default() -> Self {
        Self::new()
    }
}
