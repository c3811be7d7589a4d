//! Safe Logging (§4.14): a reusable redactor for anything that ends up in a
//! log line. Built on the peer-id mask already shared by mesh-crypto and
//! mesh-identity ([`mesh_crypto::mask_peer_id`]); this module adds the
//! pieces specific to network logging — key/signature masking, host/IP
//! masking, and an exception-message pass that catches secrets embedded in
//! free text (e.g. a dial error that echoes back a raw address).

use std::fmt;
use std::net::IpAddr;

pub use mesh_crypto::mask_peer_id;

/// Wraps a value so its `Display`/`Debug` output is always the redacted
/// form, never the raw bytes. Use at call sites that would otherwise log a
/// private key, signature, or other secret material directly, e.g.
/// `warn!(key = %Redacted(&public_key_bytes), "...")`.
pub struct Redacted<'a>(pub &'a [u8]);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} bytes redacted>", self.0.len())
    }
}

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn is_rfc1918(v4: std::net::Ipv4Addr) -> bool {
    v4.is_private() || v4.is_loopback() || v4.is_link_local()
}

/// Masks an IP host's non-network octets unless it's localhost or an
/// RFC1918 private address. Hostnames (including `.onion`/`.i2p`) are
/// returned unchanged — they carry no raw-IP information to redact.
pub fn mask_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) if is_rfc1918(v4) => host.to_string(),
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.x.x.x", o[0])
        }
        Ok(IpAddr::V6(v6)) if v6.is_loopback() => host.to_string(),
        Ok(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!("{:x}:x:x:x:x:x:x:x", segments[0])
        }
        Err(_) => host.to_string(),
    }
}

fn looks_like_peer_id(token: &str) -> bool {
    token.len() == mesh_crypto::PEER_ID_STR_LEN
        && token.chars().all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c))
}

fn looks_like_key_material(token: &str) -> bool {
    let hex_len = token.len() == mesh_crypto::PUBLIC_KEY_LEN * 2
        || token.len() == mesh_crypto::SIGNATURE_LEN * 2;
    hex_len && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// Runs an exception/error message through the same redaction rules as
/// structured fields, so embedded peer ids, key material, or raw hosts
/// don't leak through free-text error strings.
pub fn redact_exception(message: &str) -> String {
    message
        .split(' ')
        .map(|word| {
            let trimmed = word.trim_matches(|c: char| c == ',' || c == ')' || c == '(');
            if looks_like_peer_id(trimmed) {
                word.replace(trimmed, &mask_peer_id(trimmed))
            } else if looks_like_key_material(trimmed) {
                word.replace(trimmed, "<redacted>")
            } else if trimmed.parse::<IpAddr>().is_ok() {
                word.replace(trimmed, &mask_host(trimmed))
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
