//! Message Signing Layer (§4.11): signs and verifies control envelopes
//! using the local Ed25519 key and the canonical envelope encoding (C2).

use std::time::{SystemTime, UNIX_EPOCH};

use mesh_crypto::{verify, CryptoError, PrivateKey, PublicKey, SIGNATURE_LEN};
use mesh_identity::canonical::envelope_signable_bytes;
use thiserror::Error;

/// Signed control envelopes are rejected if their timestamp is more than
/// this far from the verifier's clock, in either direction.
pub const FRESHNESS_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("public key must be {SIGNATURE_LEN} bytes, got {0}")]
    MalformedPublicKey(usize),
    #[error("signature must be {SIGNATURE_LEN} bytes, got {0}")]
    MalformedSignature(usize),
    #[error("envelope timestamp {timestamp_ms}ms is outside the freshness window (now={now_ms}ms)")]
    Stale { timestamp_ms: i64, now_ms: i64 },
    #[error("signature verification failed")]
    InvalidSignature,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A control message envelope: typed payload, signed over the canonical
/// `type|message_id|timestamp_ms|sha256(payload)` bytes.
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    pub envelope_type: String,
    pub message_id: String,
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
    pub public_key: [u8; 32],
    pub signature: [u8; SIGNATURE_LEN],
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Signs `payload` under `envelope_type`/`message_id`, stamping the
/// current time, and returns the full envelope ready to send.
pub fn sign_envelope(
    private_key: &PrivateKey,
    public_key: PublicKey,
    envelope_type: impl Into<String>,
    message_id: impl Into<String>,
    payload: Vec<u8>,
) -> SignedEnvelope {
    let envelope_type = envelope_type.into();
    let message_id = message_id.into();
    let timestamp_ms = now_ms();
    let signable = envelope_signable_bytes(&envelope_type, &message_id, timestamp_ms, &payload);
    let signature = mesh_crypto::sign(private_key, &signable);
    SignedEnvelope {
        envelope_type,
        message_id,
        timestamp_ms,
        payload,
        public_key: *public_key.as_bytes(),
        signature,
    }
}

/// Verifies a received envelope: the signature over the canonical bytes,
/// and that the timestamp falls within [`FRESHNESS_WINDOW_SECS`] of now.
pub fn verify_envelope(envelope: &SignedEnvelope) -> Result<(), EnvelopeError> {
    let now = now_ms();
    if (now - envelope.timestamp_ms).abs() > FRESHNESS_WINDOW_SECS * 1000 {
        return Err(EnvelopeError::Stale {
            timestamp_ms: envelope.timestamp_ms,
            now_ms: now,
        });
    }

    let public_key = PublicKey::from_bytes(&envelope.public_key)?;
    let signable = envelope_signable_bytes(
        &envelope.envelope_type,
        &envelope.message_id,
        envelope.timestamp_ms,
        &envelope.payload,
    );
    if verify(&public_key, &signable, &envelope.signature)? {
        Ok(())
    } else {
        Err(EnvelopeError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let keypair = mesh_crypto::generate();
        let envelope = sign_envelope(
            keypair.private(),
            keypair.public(),
            "ping",
            "msg-1",
            b"hello".to_vec(),
        );
        assert!(verify_envelope(&envelope).is_ok());
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let keypair = mesh_crypto::generate();
        let mut envelope = sign_envelope(
            keypair.private(),
            keypair.public(),
            "ping",
            "msg-1",
            b"hello".to_vec(),
        );
        envelope.payload = b"goodbye".to_vec();
        assert_eq!(verify_envelope(&envelope), Err(EnvelopeError::InvalidSignature));
    }

    #[test]
    fn wrong_signer_fails_verification() {
        let keypair = mesh_crypto::generate();
        let other = mesh_crypto::generate();
        let mut envelope = sign_envelope(
            keypair.private(),
            keypair.public(),
            "ping",
            "msg-1",
            b"hello".to_vec(),
        );
        envelope.public_key = *other.public().as_bytes();
        assert_eq!(verify_envelope(&envelope), Err(EnvelopeError::InvalidSignature));
    }

    #[test]
    fn future_timestamp_beyond_window_is_stale() {
        let keypair = mesh_crypto::generate();
        let mut envelope = sign_envelope(
            keypair.private(),
            keypair.public(),
            "ping",
            "msg-1",
            b"hello".to_vec(),
        );
        envelope.timestamp_ms = now_ms() + (FRESHNESS_WINDOW_SECS + 60) * 1000;
        assert!(matches!(verify_envelope(&envelope), Err(EnvelopeError::Stale { .. })));
    }

    #[test]
    fn past_timestamp_beyond_window_is_stale() {
        let keypair = mesh_crypto::generate();
        let mut envelope = sign_envelope(
            keypair.private(),
            keypair.public(),
            "ping",
            "msg-1",
            b"hello".to_vec(),
        );
        envelope.timestamp_ms = now_ms() - (FRESHNESS_WINDOW_SECS + 60) * 1000;
        assert!(matches!(verify_envelope(&envelope), Err(EnvelopeError::Stale { .. })));
    }
}
