//! Identity & signing primitives for the mesh transport core.
//!
//! Self-certifying peer identity: every [`PeerId`] is derived solely from
//! its owner's Ed25519 public key, so a peer id can be verified without
//! any out-of-band lookup. See the canonical derivation in
//! [`peer_id_from`].

use std::fmt;

use data_encoding::{Encoding, Specification};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const PRIVATE_KEY_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const PEER_ID_RAW_LEN: usize = 20;
pub const PEER_ID_STR_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("malformed key material")]
    MalformedKey,
}

/// Lowercase RFC 4648 base32 alphabet without padding, used for peer ids.
static BASE32_LOWER_NOPAD: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding().expect("static base32 spec is valid")
});

/// Ed25519 private key. Zeroized on drop; never serialized.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; PRIVATE_KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PRIVATE_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PRIVATE_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PRIVATE_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(REDACTED)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PublicKey(#[serde(with = "serde_pubkey")] [u8; PUBLIC_KEY_LEN]);

mod serde_pubkey {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", data_encoding::HEXLOWER.encode(&self.0))
    }
}

/// An Ed25519 key pair, generated on first run and persisted by the caller
/// via the secret-storage collaborator (`mesh-node`); never serialized as a
/// whole.
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn private(&self) -> &PrivateKey {
        &self.private
    }

    pub fn peer_id(&self) -> PeerId {
        peer_id_from(&self.public)
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        sign(&self.private, data)
    }

    pub fn from_private(private: PrivateKey) -> Self {
        let signing_key = SigningKey::from_bytes(private.as_bytes());
        let public = PublicKey(signing_key.verifying_key().to_bytes());
        Self { private, public }
    }
}

/// Generate a fresh Ed25519 key pair using the OS CSPRNG.
pub fn generate() -> KeyPair {
    let mut seed = [0u8; PRIVATE_KEY_LEN];
    OsRng.fill_bytes(&mut seed);
    let signing_key = SigningKey::from_bytes(&seed);
    let public = PublicKey(signing_key.verifying_key().to_bytes());
    KeyPair {
        private: PrivateKey(seed),
        public,
    }
}

/// Sign `data` with the given private key, producing a 64-byte Ed25519
/// signature.
pub fn sign(private: &PrivateKey, data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let signing_key = SigningKey::from_bytes(private.as_bytes());
    signing_key.sign(data).to_bytes()
}

/// Verify an Ed25519 signature. Returns `Ok(true)`/`Ok(false)` rather than
/// an error for a failed verification; malformed inputs are reported as
/// `CryptoError`.
pub fn verify(public: &PublicKey, data: &[u8], signature: &[u8]) -> Result<bool, CryptoError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignatureLength {
            expected: SIGNATURE_LEN,
            actual: signature.len(),
        });
    }
    let verifying_key =
        VerifyingKey::from_bytes(public.as_bytes()).map_err(|_| CryptoError::MalformedKey)?;
    let sig_bytes: [u8; SIGNATURE_LEN] = signature.try_into().expect("length checked above");
    let sig = Signature::from_bytes(&sig_bytes);
    Ok(verifying_key.verify(data, &sig).is_ok())
}

/// Self-certifying peer identifier: the first 20 bytes of SHA-256(public
/// key), lowercase base32 (RFC 4648 alphabet, unpadded). Always 32
/// characters.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `first4...last4` form used by the safe-logging redactor (C14).
    pub fn masked(&self) -> String {
        mask_peer_id(&self.0)
    }
}

/// `first4...last4`, or `***` for anything too short to truncate safely.
/// The canonical peer id mask; reused wherever a peer id needs redacting
/// outside of a [`PeerId`] value (e.g. descriptors carry peer ids as plain
/// strings).
pub fn mask_peer_id(peer_id: &str) -> String {
    if peer_id.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &peer_id[..4], &peer_id[peer_id.len() - 4..])
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.masked())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive a peer id from a public key: SHA-256(pubkey)[0..20], lowercase
/// base32, unpadded. Stable across implementations (§4.1).
pub fn peer_id_from(public: &PublicKey) -> PeerId {
    let digest = Sha256::digest(public.as_bytes());
    let raw = &digest[..PEER_ID_RAW_LEN];
    let encoded = BASE32_LOWER_NOPAD.encode(raw).to_lowercase();
    debug_assert_eq!(encoded.len(), PEER_ID_STR_LEN);
    PeerId(encoded)
}

/// Recover the raw 20-byte `SHA-256(pubkey)[0..20]` digest backing a peer
/// id string, e.g. for use as a Kademlia node id.
pub fn peer_id_raw_bytes(peer_id: &str) -> Result<[u8; PEER_ID_RAW_LEN], CryptoError> {
    let decoded = BASE32_LOWER_NOPAD
        .decode(peer_id.as_bytes())
        .map_err(|_| CryptoError::MalformedKey)?;
    decoded.try_into().map_err(|_| CryptoError::MalformedKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_from_all_zero_key() {
        let zero_key = PublicKey([0u8; PUBLIC_KEY_LEN]);
        let id = peer_id_from(&zero_key);
        assert_eq!(id.as_str().len(), PEER_ID_STR_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let digest = Sha256::digest(&zero_key.0);
        let expected = BASE32_LOWER_NOPAD
            .encode(&digest[..PEER_ID_RAW_LEN])
            .to_lowercase();
        assert_eq!(id.as_str(), expected);
    }

    #[test]
    fn sign_verify_round_trip() {
        let kp = generate();
        let message = b"mesh transport handshake payload";
        let sig = kp.sign(message);
        assert!(verify(&kp.public(), message, &sig).unwrap());
    }

    #[test]
    fn flipping_a_message_bit_breaks_verification() {
        let kp = generate();
        let message = b"some control envelope bytes".to_vec();
        let sig = kp.sign(&message);

        let mut tampered = message.clone();
        tampered[0] ^= 0x01;
        assert!(!verify(&kp.public(), &tampered, &sig).unwrap());
    }

    #[test]
    fn flipping_a_signature_bit_breaks_verification() {
        let kp = generate();
        let message = b"some control envelope bytes";
        let mut sig = kp.sign(message);
        sig[0] ^= 0x01;
        assert!(!verify(&kp.public(), message, &sig).unwrap());
    }

    #[test]
    fn wrong_length_key_is_rejected() {
        let err = PrivateKey::from_bytes(&[0u8; 10]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidKeyLength { expected: 32, actual: 10 });
    }

    #[test]
    fn wrong_length_signature_is_rejected() {
        let kp = generate();
        let err = verify(&kp.public(), b"data", &[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidSignatureLength { expected: 64, actual: 10 }
        );
    }

    #[test]
    fn peer_id_raw_bytes_round_trips() {
        let kp = generate();
        let id = kp.peer_id();
        let raw = peer_id_raw_bytes(id.as_str()).unwrap();
        let digest = Sha256::digest(kp.public().as_bytes());
        assert_eq!(&raw[..], &digest[..PEER_ID_RAW_LEN]);
    }

    #[test]
    fn two_distinct_keys_yield_distinct_peer_ids() {
        let a = generate();
        let b = generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    proptest::proptest! {
        #[test]
        fn peer_id_is_always_well_formed(seed in proptest::array::uniform32(0u8..=255)) {
            let signing_key = SigningKey::from_bytes(&seed);
            let public = PublicKey(signing_key.verifying_key().to_bytes());
            let id = peer_id_from(&public);
            proptest::prop_assert_eq!(id.as_str().len(), PEER_ID_STR_LEN);
            proptest::prop_assert!(id
                .as_str()
                .chars()
                .all(|c| ('a'..='z').contains(&c) || ('2'..='7').contains(&c)));
        }
    }
}
