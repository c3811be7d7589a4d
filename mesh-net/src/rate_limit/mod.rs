//! Rate Limiter & Throttler (§4.9).
//!
//! Token buckets keyed by string (global, per-endpoint, per-transport,
//! per-envelope-type, per-peer auth-failure). Unlike the handshake limiter
//! this crate's sibling modules are grounded on (which hands the token
//! accounting to `governor`'s internal GCRA state), the bucket fields here
//! are spelled out explicitly because the sweeper and the backoff
//! calculation both need to read `last_access`/`tokens` directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::warn;

/// One second of monotonic time expressed as the tick unit buckets refill
/// against; kept as `f64` seconds internally so `elapsed * refill_rate`
/// doesn't lose precision to integer truncation.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
    allowed: u64,
    blocked: u64,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        let now = Instant::now();
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
            last_access: now,
            allowed: 0,
            blocked: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        self.last_access = now;
        if self.tokens >= n {
            self.tokens -= n;
            self.allowed += 1;
            true
        } else {
            self.blocked += 1;
            false
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }
}

/// Tunable capacity/refill pair for one bucket class. Rates are expressed
/// per minute in the config surface and converted to per-second refill
/// internally.
#[derive(Debug, Clone, Copy)]
pub struct BucketQuota {
    pub capacity: u32,
    pub per_minute: u32,
}

impl BucketQuota {
    pub const fn new(capacity: u32, per_minute: u32) -> Self {
        Self { capacity, per_minute }
    }

    fn refill_rate(&self) -> f64 {
        self.per_minute as f64 / 60.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub global: BucketQuota,
    pub per_endpoint: BucketQuota,
    pub per_transport: BucketQuota,
    pub descriptor_fetch: BucketQuota,
    pub envelope: BucketQuota,
    pub auth_failure: BucketQuota,
    /// Buckets idle for at least this long are dropped by `sweep()`.
    pub sweep_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: BucketQuota::new(1000, 1000),
            per_endpoint: BucketQuota::new(10, 10),
            per_transport: BucketQuota::new(100, 100),
            descriptor_fetch: BucketQuota::new(50, 50),
            envelope: BucketQuota::new(60, 60),
            auth_failure: BucketQuota::new(5, 5),
            sweep_after: Duration::from_secs(3600),
        }
    }
}

/// A family of keyed token buckets sharing one quota (e.g. "per-endpoint").
struct BucketFamily {
    quota: BucketQuota,
    buckets: RwLock<HashMap<String, TokenBucket>>,
}

impl BucketFamily {
    fn new(quota: BucketQuota) -> Self {
        Self {
            quota,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn try_consume(&self, key: &str, n: u32) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.quota.capacity as f64, self.quota.refill_rate()));
        bucket.try_consume(n as f64, now)
    }

    fn sweep(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, b| b.idle_for(now) < max_idle);
        before - buckets.len()
    }

    fn tracked(&self) -> usize {
        self.buckets.read().len()
    }
}

/// Composes the global/per-endpoint/per-transport/descriptor/envelope/
/// auth-failure bucket families and applies them in the strict order the
/// spec requires for connection admission.
pub struct Throttler {
    global: BucketFamily,
    per_endpoint: BucketFamily,
    per_transport: BucketFamily,
    descriptor_fetch: BucketFamily,
    envelope: BucketFamily,
    auth_failure: BucketFamily,
    sweep_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleBucket {
    Global,
    Endpoint,
    Transport,
    DescriptorFetch,
    Envelope,
    AuthFailure,
}

impl Throttler {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            global: BucketFamily::new(config.global),
            per_endpoint: BucketFamily::new(config.per_endpoint),
            per_transport: BucketFamily::new(config.per_transport),
            descriptor_fetch: BucketFamily::new(config.descriptor_fetch),
            envelope: BucketFamily::new(config.envelope),
            auth_failure: BucketFamily::new(config.auth_failure),
            sweep_after: config.sweep_after,
        }
    }

    /// Admission check for a new connection attempt: global, then
    /// per-endpoint, then per-transport, in that order. Returns the first
    /// bucket that denied, or `None` if the attempt is admitted.
    pub fn admit_connection(&self, endpoint: &str, transport: &str) -> Option<ThrottleBucket> {
        if !self.global.try_consume("global", 1) {
            warn!("connection admission denied by global rate limit");
            return Some(ThrottleBucket::Global);
        }
        if !self.per_endpoint.try_consume(endpoint, 1) {
            warn!(endpoint, "connection admission denied by per-endpoint rate limit");
            return Some(ThrottleBucket::Endpoint);
        }
        if !self.per_transport.try_consume(transport, 1) {
            warn!(transport, "connection admission denied by per-transport rate limit");
            return Some(ThrottleBucket::Transport);
        }
        None
    }

    pub fn admit_descriptor_fetch(&self, peer_id: &str) -> bool {
        self.descriptor_fetch.try_consume(peer_id, 1)
    }

    pub fn admit_envelope(&self, peer_id: &str, envelope_type: &str) -> bool {
        self.envelope.try_consume(&format!("{peer_id}:{envelope_type}"), 1)
    }

    pub fn record_auth_failure(&self, endpoint: &str) -> bool {
        self.auth_failure.try_consume(endpoint, 1)
    }

    /// Removes buckets across all families that have been idle for at
    /// least the configured sweep interval. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.global.sweep(self.sweep_after)
            + self.per_endpoint.sweep(self.sweep_after)
            + self.per_transport.sweep(self.sweep_after)
            + self.descriptor_fetch.sweep(self.sweep_after)
            + self.envelope.sweep(self.sweep_after)
            + self.auth_failure.sweep(self.sweep_after)
    }

    pub fn tracked_endpoints(&self) -> usize {
        self.per_endpoint.tracked()
    }
}

/// Progressive backoff state after repeated auth failures against one
/// endpoint, per §4.9: `backoff_until = last_failure + base * 2^(min(failures - n, 10))`.
pub struct ConnectionAttemptInfo {
    consecutive_failures: AtomicU64,
    last_failure: RwLock<Option<Instant>>,
    threshold: u32,
    base: Duration,
}

impl ConnectionAttemptInfo {
    pub fn new(threshold: u32, base: Duration) -> Self {
        Self {
            consecutive_failures: AtomicU64::new(0),
            last_failure: RwLock::new(None),
            threshold,
            base,
        }
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_failure.write() = Some(Instant::now());
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_failure.write() = None;
    }

    /// `true` once enough consecutive failures have accrued and we are
    /// still inside the resulting backoff window.
    pub fn is_backing_off(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures <= self.threshold as u64 {
            return false;
        }
        let Some(last_failure) = *self.last_failure.read() else {
            return false;
        };
        let exponent = (failures - self.threshold as u64).min(10) as u32;
        let backoff = self.base * 2u32.pow(exponent);
        Instant::now() < last_failure + backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_admits_up_to_capacity_then_blocks() {
        let family = BucketFamily::new(BucketQuota::new(3, 60));
        assert!(family.try_consume("a", 1));
        assert!(family.try_consume("a", 1));
        assert!(family.try_consume("a", 1));
        assert!(!family.try_consume("a", 1));
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let family = BucketFamily::new(BucketQuota::new(1, 60));
        assert!(family.try_consume("a", 1));
        assert!(family.try_consume("b", 1));
        assert!(!family.try_consume("a", 1));
    }

    #[test]
    fn throttler_checks_global_before_endpoint_before_transport() {
        let mut config = RateLimitConfig::default();
        config.global = BucketQuota::new(1000, 1000);
        config.per_endpoint = BucketQuota::new(1, 60);
        config.per_transport = BucketQuota::new(1000, 1000);
        let throttler = Throttler::new(config);

        assert_eq!(throttler.admit_connection("10.0.0.1:9000", "quic"), None);
        assert_eq!(
            throttler.admit_connection("10.0.0.1:9000", "quic"),
            Some(ThrottleBucket::Endpoint)
        );
    }

    #[test]
    fn global_exhaustion_blocks_before_endpoint_is_even_checked() {
        let mut config = RateLimitConfig::default();
        config.global = BucketQuota::new(1, 60);
        let throttler = Throttler::new(config);

        assert_eq!(throttler.admit_connection("a", "quic"), None);
        assert_eq!(throttler.admit_connection("b", "quic"), Some(ThrottleBucket::Global));
    }

    #[test]
    fn sweep_drops_only_idle_buckets() {
        let family = BucketFamily::new(BucketQuota::new(10, 60));
        assert!(family.try_consume("stale", 1));
        assert_eq!(family.tracked(), 1);
        assert_eq!(family.sweep(Duration::from_secs(0)), 1);
        assert_eq!(family.tracked(), 0);
    }

    #[test]
    fn backoff_blocks_only_after_threshold_and_expires() {
        let info = ConnectionAttemptInfo::new(2, Duration::from_millis(20));
        info.record_failure();
        info.record_failure();
        assert!(!info.is_backing_off());

        info.record_failure();
        assert!(info.is_backing_off());

        std::thread::sleep(Duration::from_millis(50));
        assert!(!info.is_backing_off());
    }

    #[test]
    fn success_resets_failure_count() {
        let info = ConnectionAttemptInfo::new(1, Duration::from_millis(20));
        info.record_failure();
        info.record_failure();
        info.record_success();
        assert!(!info.is_backing_off());
    }
}
