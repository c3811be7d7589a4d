//! Peer Descriptor & Anti-Rollback (C3).

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use mesh_crypto::{mask_peer_id, verify, CryptoError, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::canonical::descriptor_signable_bytes;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("peer id is empty or malformed")]
    Validation(String),
    #[error("descriptor signature is invalid")]
    Signature,
    #[error("sequence number {got} does not exceed last accepted {last_accepted}")]
    Rollback { got: u64, last_accepted: u64 },
    #[error("descriptor expired at {expires_at}")]
    Expired { expires_at: i64 },
}

impl From<CryptoError> for DescriptorError {
    fn from(_: CryptoError) -> Self {
        DescriptorError::Signature
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransportType {
    DirectQuic = 0,
    TorOnionQuic = 1,
    I2PQuic = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Scope {
    Control = 0,
    Data = 1,
    ControlAndData = 2,
}

impl Scope {
    /// Whether this endpoint may be used for a connection that needs `need`.
    pub fn compatible_with(self, need: Scope) -> bool {
        matches!(
            (self, need),
            (Scope::ControlAndData, _)
                | (Scope::Control, Scope::Control)
                | (Scope::Data, Scope::Data)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportEndpoint {
    pub transport_type: TransportType,
    pub host: String,
    pub port: u16,
    pub scope: Scope,
    /// Lower is better.
    pub preference: i32,
    pub cost: i32,
    pub valid_from: Option<i64>,
    pub valid_to: Option<i64>,
}

impl TransportEndpoint {
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        self.valid_from.map_or(true, |v| now_ms >= v) && self.valid_to.map_or(true, |v| now_ms <= v)
    }
}

/// `<16 or 56 char base32>.onion`, per the onion v2/v3 address format.
pub fn is_valid_onion_host(host: &str) -> bool {
    let Some(label) = host.strip_suffix(".onion") else {
        return false;
    };
    let is_base32 = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_lowercase() && ('a'..='z').contains(&c) || ('2'..='7').contains(&c));
    (label.len() == 16 || label.len() == 56) && is_base32(label)
}

/// I2P hostnames: end in `.i2p`; label chars in `[A-Za-z0-9._-]`, length 1..=200.
pub fn is_valid_i2p_host(host: &str) -> bool {
    let Some(label) = host.strip_suffix(".i2p") else {
        return false;
    };
    !label.is_empty()
        && label.len() <= 200
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: String,
    pub sequence_number: u64,
    pub expires_at: i64,
    pub endpoints: Vec<TransportEndpoint>,
    pub certificate_pins: BTreeSet<String>,
    pub control_signing_keys: BTreeSet<String>,
    #[serde(with = "serde_sig")]
    pub signature: [u8; 64],
}

mod serde_sig {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Sign a descriptor's canonical bytes with the owner's private key,
/// populating `signature`.
pub fn sign(descriptor: &mut PeerDescriptor, private: &mesh_crypto::PrivateKey) {
    let bytes = descriptor_signable_bytes(descriptor);
    descriptor.signature = mesh_crypto::sign(private, &bytes);
}

/// Per-peer last-accepted sequence numbers, serialized per peer id (§5).
#[derive(Default)]
pub struct SequenceTracker {
    last_accepted: DashMap<String, u64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_accepted(&self, peer_id: &str) -> Option<u64> {
        self.last_accepted.get(peer_id).map(|v| *v)
    }
}

/// Verify a descriptor given the claimed owner's public key (carried
/// alongside the descriptor on the wire, outside the canonically-signed
/// fields). Checks, in the §4.3 fail-fast order: `peer_id` matches its
/// derivation from `public` → non-empty → not expired → sequence strictly
/// greater than last accepted → signature valid. On success, atomically
/// advances the tracked sequence for this peer id. On failure, the
/// tracked sequence is left untouched and the rejection is logged with a
/// privacy-safe peer id.
/// checks that `peer_id` matches `peer_id_from(public)` (invariant d, §3).
pub fn verify_descriptor_with_key(
    descriptor: &PeerDescriptor,
    public: &PublicKey,
    tracker: &SequenceTracker,
) -> Result<(), DescriptorError> {
    let derived = mesh_crypto::peer_id_from(public);
    if derived.as_str() != descriptor.peer_id {
        return Err(DescriptorError::Validation(
            "peer_id does not match public key".to_string(),
        ));
    }

    if descriptor.peer_id.is_empty() {
        return Err(DescriptorError::Validation("empty peer_id".to_string()));
    }
    if now_ms() >= descriptor.expires_at {
        warn!(peer_id = %mask_peer_id(&descriptor.peer_id), "descriptor expired");
        return Err(DescriptorError::Expired {
            expires_at: descriptor.expires_at,
        });
    }

    let mut entry = tracker
        .last_accepted
        .entry(descriptor.peer_id.clone())
        .or_insert(0);
    let last = *entry;
    if descriptor.sequence_number <= last {
        warn!(
            peer_id = %mask_peer_id(&descriptor.peer_id),
            got = descriptor.sequence_number,
            last_accepted = last,
            "rollback rejected"
        );
        return Err(DescriptorError::Rollback {
            got: descriptor.sequence_number,
            last_accepted: last,
        });
    }

    let bytes = descriptor_signable_bytes(descriptor);
    let ok = verify(public, &bytes, &descriptor.signature)?;
    if !ok {
        warn!(peer_id = %mask_peer_id(&descriptor.peer_id), "signature invalid");
        return Err(DescriptorError::Signature);
    }

    *entry = descriptor.sequence_number;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> TransportEndpoint {
        TransportEndpoint {
            transport_type: TransportType::DirectQuic,
            host: "example.com".into(),
            port: 1,
            scope: Scope::ControlAndData,
            preference: 0,
            cost: 0,
            valid_from: None,
            valid_to: None,
        }
    }

    fn signed_descriptor(
        kp: &mesh_crypto::KeyPair,
        sequence_number: u64,
        expires_in_ms: i64,
    ) -> PeerDescriptor {
        let mut d = PeerDescriptor {
            peer_id: kp.peer_id().to_string(),
            sequence_number,
            expires_at: now_ms() + expires_in_ms,
            endpoints: vec![endpoint()],
            certificate_pins: BTreeSet::new(),
            control_signing_keys: BTreeSet::new(),
            signature: [0u8; 64],
        };
        sign(&mut d, kp.private());
        d
    }

    #[test]
    fn accepts_first_valid_descriptor() {
        let kp = mesh_crypto::generate();
        let tracker = SequenceTracker::new();
        let d = signed_descriptor(&kp, 1, 60_000);
        assert!(verify_descriptor_with_key(&d, &kp.public(), &tracker).is_ok());
    }

    #[test]
    fn rejects_rollback_and_leaves_sequence_unchanged() {
        let kp = mesh_crypto::generate();
        let tracker = SequenceTracker::new();
        let d1 = signed_descriptor(&kp, 5, 60_000);
        verify_descriptor_with_key(&d1, &kp.public(), &tracker).unwrap();

        let d2 = signed_descriptor(&kp, 5, 60_000);
        let err = verify_descriptor_with_key(&d2, &kp.public(), &tracker).unwrap_err();
        assert_eq!(
            err,
            DescriptorError::Rollback {
                got: 5,
                last_accepted: 5
            }
        );
        assert_eq!(tracker.last_accepted(&kp.peer_id().to_string()), Some(5));
    }

    #[test]
    fn rejects_expired_descriptor() {
        let kp = mesh_crypto::generate();
        let tracker = SequenceTracker::new();
        let d = signed_descriptor(&kp, 1, -1000);
        assert!(matches!(
            verify_descriptor_with_key(&d, &kp.public(), &tracker),
            Err(DescriptorError::Expired { .. })
        ));
    }

    #[test]
    fn rejects_bad_signature() {
        let kp = mesh_crypto::generate();
        let tracker = SequenceTracker::new();
        let mut d = signed_descriptor(&kp, 1, 60_000);
        d.signature[0] ^= 0xFF;
        assert_eq!(
            verify_descriptor_with_key(&d, &kp.public(), &tracker),
            Err(DescriptorError::Signature)
        );
    }

    #[test]
    fn onion_v3_hostname_validation() {
        let v3 = "a".repeat(56) + ".onion";
        assert!(is_valid_onion_host(&v3));
        let v2 = "a".repeat(16) + ".onion";
        assert!(is_valid_onion_host(&v2));
        assert!(!is_valid_onion_host("example.com"));
        assert!(!is_valid_onion_host("Aaaaaaaaaaaaaaaa.onion"));
    }

    #[test]
    fn i2p_hostname_validation() {
        assert!(is_valid_i2p_host("my-dest_1.b32.i2p"));
        assert!(!is_valid_i2p_host("example.com"));
        assert!(!is_valid_i2p_host(&("x".repeat(201) + ".i2p")));
    }
}
