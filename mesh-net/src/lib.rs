//! Routing, DHT, NAT traversal, transport dialers, policy, rate limiting,
//! replay defense, signed envelopes, circuits, privacy shaping, and safe
//! logging for the mesh transport core.

pub mod circuit;
pub mod dht;
pub mod envelope;
pub mod health;
pub mod nat;
pub mod policy;
pub mod privacy;
pub mod rate_limit;
pub mod redact;
pub mod replay;
pub mod routing;
pub mod transport;
