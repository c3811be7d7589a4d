//! Canonical Encoding (C2).
//!
//! Produces a deterministic byte form of a [`crate::descriptor::PeerDescriptor`]
//! for signing, and of a control envelope's signable fields. The encoding
//! uses a fixed field order, sorts collections before emission, and never
//! relies on map iteration order, floating point, or compression — two
//! semantically equivalent descriptors always produce identical bytes.

use sha2::{Digest, Sha256};

use crate::descriptor::{PeerDescriptor, TransportEndpoint};

fn write_len_prefixed(buf: &mut Vec<u8>, s: &[u8]) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s);
}

fn write_option_i64(buf: &mut Vec<u8>, v: Option<i64>) {
    match v {
        Some(x) => {
            buf.push(1);
            buf.extend_from_slice(&x.to_be_bytes());
        }
        None => buf.push(0),
    }
}

/// Locale-independent comparator: (transport_type discriminant, host, port).
fn endpoint_sort_key(e: &TransportEndpoint) -> (u8, &str, u16) {
    (e.transport_type as u8, e.host.as_str(), e.port)
}

fn encode_endpoint(buf: &mut Vec<u8>, e: &TransportEndpoint) {
    buf.push(e.transport_type as u8);
    write_len_prefixed(buf, e.host.as_bytes());
    buf.extend_from_slice(&e.port.to_be_bytes());
    buf.push(e.scope as u8);
    buf.extend_from_slice(&e.preference.to_be_bytes());
    buf.extend_from_slice(&e.cost.to_be_bytes());
    write_option_i64(buf, e.valid_from);
    write_option_i64(buf, e.valid_to);
}

/// Canonical signable bytes of a descriptor, excluding the signature field.
pub fn descriptor_signable_bytes(d: &PeerDescriptor) -> Vec<u8> {
    let mut buf = Vec::new();

    write_len_prefixed(&mut buf, d.peer_id.as_bytes());
    buf.extend_from_slice(&d.sequence_number.to_be_bytes());
    buf.extend_from_slice(&d.expires_at.to_be_bytes());

    let mut endpoints: Vec<&TransportEndpoint> = d.endpoints.iter().collect();
    endpoints.sort_by(|a, b| endpoint_sort_key(a).cmp(&endpoint_sort_key(b)));
    buf.extend_from_slice(&(endpoints.len() as u32).to_be_bytes());
    for e in endpoints {
        encode_endpoint(&mut buf, e);
    }

    let mut pins: Vec<&str> = d.certificate_pins.iter().map(String::as_str).collect();
    pins.sort_unstable();
    buf.extend_from_slice(&(pins.len() as u32).to_be_bytes());
    for p in pins {
        write_len_prefixed(&mut buf, p.as_bytes());
    }

    let mut keys: Vec<&str> = d.control_signing_keys.iter().map(String::as_str).collect();
    keys.sort_unstable();
    buf.extend_from_slice(&(keys.len() as u32).to_be_bytes());
    for k in keys {
        write_len_prefixed(&mut buf, k.as_bytes());
    }

    buf
}

/// Canonical envelope signing input: `type|message_id|timestamp_ms|base64(sha256(payload))`.
pub fn envelope_signable_bytes(
    envelope_type: &str,
    message_id: &str,
    timestamp_ms: i64,
    payload: &[u8],
) -> Vec<u8> {
    let payload_hash = Sha256::digest(payload);
    let payload_hash_b64 = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        payload_hash,
    );
    format!(
        "{}|{}|{}|{}",
        envelope_type, message_id, timestamp_ms, payload_hash_b64
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Scope, TransportEndpoint, TransportType};
    use std::collections::BTreeSet;

    fn base_descriptor() -> PeerDescriptor {
        PeerDescriptor {
            peer_id: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            sequence_number: 1,
            expires_at: 1_900_000_000_000,
            endpoints: vec![
                TransportEndpoint {
                    transport_type: TransportType::DirectQuic,
                    host: "example.com".to_string(),
                    port: 443,
                    scope: Scope::ControlAndData,
                    preference: 0,
                    cost: 0,
                    valid_from: None,
                    valid_to: None,
                },
                TransportEndpoint {
                    transport_type: TransportType::TorOnionQuic,
                    host: "abcdefghijklmnop.onion".to_string(),
                    port: 9001,
                    scope: Scope::Data,
                    preference: 1,
                    cost: 5,
                    valid_from: Some(0),
                    valid_to: None,
                },
            ],
            certificate_pins: BTreeSet::new(),
            control_signing_keys: BTreeSet::new(),
            signature: [0u8; 64],
        }
    }

    #[test]
    fn field_order_in_memory_does_not_affect_bytes() {
        let mut d1 = base_descriptor();
        let mut d2 = base_descriptor();
        d2.endpoints.reverse();
        d1.certificate_pins.insert("bbbb".into());
        d1.certificate_pins.insert("aaaa".into());
        d2.certificate_pins.insert("aaaa".into());
        d2.certificate_pins.insert("bbbb".into());

        assert_eq!(
            descriptor_signable_bytes(&d1),
            descriptor_signable_bytes(&d2)
        );
    }

    #[test]
    fn semantic_difference_changes_bytes() {
        let d1 = base_descriptor();
        let mut d2 = base_descriptor();
        d2.sequence_number += 1;
        assert_ne!(
            descriptor_signable_bytes(&d1),
            descriptor_signable_bytes(&d2)
        );
    }

    #[test]
    fn envelope_bytes_are_utf8_pipe_separated() {
        let bytes = envelope_signable_bytes("ping", "msg-1", 1000, b"hello");
        let s = String::from_utf8(bytes).unwrap();
        let parts: Vec<&str> = s.split('|').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "ping");
        assert_eq!(parts[1], "msg-1");
        assert_eq!(parts[2], "1000");
    }
}
