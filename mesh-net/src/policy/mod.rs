//! Transport Policy & Selector (§4.8).
//!
//! Resolves the applicable policy for a target peer, filters and orders
//! its candidate endpoints, applies trust-history-derived downgrade
//! protection, and drives the per-candidate dial loop against C9/C7.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use mesh_identity::{PeerDescriptor, Scope, TransportEndpoint, TransportType};
use thiserror::Error;
use tracing::warn;

use crate::health::{HealthReporter, HealthSample, NullHealthReporter};
use crate::rate_limit::Throttler;
use crate::transport::{DialError, Dialer, DialerStream};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// How privacy-preserving a transport is, ordered so that the downgrade
/// check in step 6 of §4.8 ("reject transports below it") is meaningful:
/// `Private` (Tor/I2P) is the strictest requirement, `Clearnet` the
/// loosest non-`Any` one. `Ord` here is chosen by what "downgrade" has
/// to mean, not by enum declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    Any,
    Basic,
    Clearnet,
    Private,
}

pub fn transport_security_level(t: TransportType) -> SecurityLevel {
    match t {
        TransportType::TorOnionQuic | TransportType::I2PQuic => SecurityLevel::Private,
        TransportType::DirectQuic => SecurityLevel::Clearnet,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyScope {
    Global,
    Pod(String),
    Peer(String),
}

impl PolicyScope {
    fn specificity(&self) -> u8 {
        match self {
            PolicyScope::Global => 0,
            PolicyScope::Pod(_) => 1,
            PolicyScope::Peer(_) => 2,
        }
    }

    fn matches(&self, peer_id: &str, pod: Option<&str>) -> bool {
        match self {
            PolicyScope::Global => true,
            PolicyScope::Pod(p) => pod == Some(p.as_str()),
            PolicyScope::Peer(id) => id == peer_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub scope: PolicyScope,
    pub allowed_transports: HashSet<TransportType>,
    pub forbid_clearnet: bool,
    pub prefer_private: bool,
}

impl TransportPolicy {
    pub fn allow_all(scope: PolicyScope) -> Self {
        Self {
            scope,
            allowed_transports: [TransportType::DirectQuic, TransportType::TorOnionQuic, TransportType::I2PQuic]
                .into_iter()
                .collect(),
            forbid_clearnet: false,
            prefer_private: false,
        }
    }
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self::allow_all(PolicyScope::Global)
    }
}

/// Holds the active policy set behind an `ArcSwap` so a reload (§4.8,
/// mirroring the node's hot-reloadable config) never blocks readers.
pub struct PolicyRegistry {
    policies: ArcSwap<Vec<TransportPolicy>>,
}

impl PolicyRegistry {
    pub fn new(policies: Vec<TransportPolicy>) -> Self {
        Self {
            policies: ArcSwap::from_pointee(policies),
        }
    }

    pub fn replace(&self, policies: Vec<TransportPolicy>) {
        self.policies.store(Arc::new(policies));
    }

    /// Resolves by specificity: the most specific matching scope wins,
    /// falling back to the built-in allow-all default if nothing matches.
    pub fn resolve(&self, peer_id: &str, pod: Option<&str>) -> TransportPolicy {
        self.policies
            .load()
            .iter()
            .filter(|p| p.scope.matches(peer_id, pod))
            .max_by_key(|p| p.scope.specificity())
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

struct AttemptRecord {
    level: SecurityLevel,
    success: bool,
}

const TRUST_HISTORY_DEPTH: usize = 50;

/// Per-peer record of recent connection outcomes by transport security
/// level, used to derive a downgrade-protection floor and to flag the
/// classic downgrade-attack signature (private failures immediately
/// followed by a clearnet success).
#[derive(Default)]
pub struct TrustHistory {
    records: DashMap<String, VecDeque<AttemptRecord>>,
}

impl TrustHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, peer_id: &str, level: SecurityLevel, success: bool) {
        let mut entry = self.records.entry(peer_id.to_string()).or_default();
        if entry.len() >= TRUST_HISTORY_DEPTH {
            entry.pop_front();
        }
        entry.push_back(AttemptRecord { level, success });
    }

    /// The highest security level this peer has ever been successfully
    /// reached at; candidates below it are rejected unless none qualify.
    pub fn minimum_security_level(&self, peer_id: &str) -> SecurityLevel {
        self.records
            .get(peer_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|r| r.success)
                    .map(|r| r.level)
                    .max()
                    .unwrap_or(SecurityLevel::Any)
            })
            .unwrap_or(SecurityLevel::Any)
    }

    /// `true` if the most recent private-transport attempts failed and
    /// were immediately followed by a clearnet success — the signature of
    /// an active transport downgrade attack.
    pub fn attack_pattern_signal(&self, peer_id: &str) -> bool {
        let Some(entries) = self.records.get(peer_id) else {
            return false;
        };
        let mut saw_private_failure = false;
        for record in entries.iter() {
            match (record.level, record.success) {
                (SecurityLevel::Private, false) => saw_private_failure = true,
                (SecurityLevel::Clearnet, true) if saw_private_failure => return true,
                (_, true) => saw_private_failure = false,
                _ => {}
            }
        }
        false
    }

    /// Number of distinct peers with recorded attempt history.
    pub fn tracked_peers(&self) -> usize {
        self.records.len()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("no transport satisfies policy, scope, validity, and security constraints")]
    NoAcceptableTransport,
}

/// Filters and orders the descriptor's endpoints per §4.8 steps 3-6.
/// Returns endpoints in dial order; never falls back to clearnet when
/// the policy forbids it even if that leaves the result empty (fail-closed).
pub fn select_candidates(
    descriptor: &PeerDescriptor,
    policy: &TransportPolicy,
    local_transports: &[TransportType],
    scope_needed: Scope,
    history: &TrustHistory,
    peer_id: &str,
    now: i64,
) -> Result<Vec<TransportEndpoint>, PolicyError> {
    let mut candidates: Vec<TransportEndpoint> = descriptor
        .endpoints
        .iter()
        .filter(|e| local_transports.contains(&e.transport_type))
        .filter(|e| policy.allowed_transports.contains(&e.transport_type))
        .filter(|e| e.scope.compatible_with(scope_needed))
        .filter(|e| e.is_valid_at(now))
        .cloned()
        .collect();

    if policy.forbid_clearnet {
        candidates.retain(|e| transport_security_level(e.transport_type) != SecurityLevel::Clearnet);
    }

    let min_level = history.minimum_security_level(peer_id);
    if min_level > SecurityLevel::Any {
        let meets_floor = candidates
            .iter()
            .any(|e| transport_security_level(e.transport_type) >= min_level);
        if meets_floor {
            candidates.retain(|e| transport_security_level(e.transport_type) >= min_level);
        } else if !candidates.is_empty() {
            warn!(
                peer_id,
                ?min_level,
                "no candidate meets the trust-derived minimum security level; allowing downgrade, none higher exist"
            );
        }
    }

    if history.attack_pattern_signal(peer_id) {
        warn!(peer_id, "downgrade attack signal: private failures followed by clearnet success");
    }

    if candidates.is_empty() {
        return Err(PolicyError::NoAcceptableTransport);
    }

    candidates.sort_by_key(|e| {
        let boost = if policy.prefer_private && transport_security_level(e.transport_type) == SecurityLevel::Private {
            -10
        } else {
            0
        };
        (boost + e.preference, e.cost)
    });

    Ok(candidates)
}

fn transport_label(t: TransportType) -> &'static str {
    match t {
        TransportType::DirectQuic => "direct-quic",
        TransportType::TorOnionQuic => "tor-socks5",
        TransportType::I2PQuic => "i2p-socks5",
    }
}

fn dial_error_class(e: &DialError) -> &'static str {
    match e {
        DialError::Unsupported => "unsupported",
        DialError::Unavailable => "unavailable",
        DialError::InvalidEndpoint(_) => "invalid_endpoint",
        DialError::PinMismatch => "pin_mismatch",
        DialError::Proxy(_) => "proxy_handshake",
        DialError::Io(_) => "io",
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("all {0} candidate(s) failed to dial")]
    AllCandidatesFailed(usize),
}

/// Ties the policy registry, trust history, rate limiter, and registered
/// dialers together to resolve one outbound connection attempt.
pub struct TransportSelector {
    registry: PolicyRegistry,
    history: TrustHistory,
    throttler: Arc<Throttler>,
    dialers: Vec<(TransportType, Arc<dyn Dialer>)>,
    local_transports: Vec<TransportType>,
    health: Arc<dyn HealthReporter>,
}

impl TransportSelector {
    pub fn new(
        registry: PolicyRegistry,
        throttler: Arc<Throttler>,
        dialers: Vec<(TransportType, Arc<dyn Dialer>)>,
    ) -> Self {
        Self::with_health_reporter(registry, throttler, dialers, Arc::new(NullHealthReporter))
    }

    pub fn with_health_reporter(
        registry: PolicyRegistry,
        throttler: Arc<Throttler>,
        dialers: Vec<(TransportType, Arc<dyn Dialer>)>,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        let local_transports = dialers.iter().map(|(t, _)| *t).collect();
        Self {
            registry,
            history: TrustHistory::new(),
            throttler,
            dialers,
            local_transports,
            health,
        }
    }

    pub fn history(&self) -> &TrustHistory {
        &self.history
    }

    pub async fn connect(
        &self,
        peer_id: &str,
        descriptor: &PeerDescriptor,
        pod: Option<&str>,
        scope_needed: Scope,
        isolation_key: Option<&[u8]>,
    ) -> Result<(TransportType, DialerStream), ConnectError> {
        let policy = self.registry.resolve(peer_id, pod);
        let candidates = select_candidates(
            descriptor,
            &policy,
            &self.local_transports,
            scope_needed,
            &self.history,
            peer_id,
            now_ms(),
        )?;
        let attempted = candidates.len();

        for endpoint in candidates {
            let Some((_, dialer)) = self
                .dialers
                .iter()
                .find(|(t, d)| *t == endpoint.transport_type && d.is_available())
            else {
                continue;
            };

            let target = format!("{}:{}", endpoint.host, endpoint.port);
            if self
                .throttler
                .admit_connection(&target, transport_label(endpoint.transport_type))
                .is_some()
            {
                continue;
            }

            let level = transport_security_level(endpoint.transport_type);
            let transport = transport_label(endpoint.transport_type);
            let started = std::time::Instant::now();
            match dialer.dial(&target, peer_id, isolation_key).await {
                Ok(stream) => {
                    self.history.record_attempt(peer_id, level, true);
                    self.health.report(
                        peer_id,
                        HealthSample {
                            transport,
                            latency_ms: started.elapsed().as_millis() as u64,
                            error_class: None,
                        },
                    );
                    return Ok((endpoint.transport_type, stream));
                }
                Err(DialError::Unavailable | DialError::Unsupported) => continue,
                Err(e) => {
                    self.history.record_attempt(peer_id, level, false);
                    self.health.report(
                        peer_id,
                        HealthSample {
                            transport,
                            latency_ms: started.elapsed().as_millis() as u64,
                            error_class: Some(dial_error_class(&e)),
                        },
                    );
                    continue;
                }
            }
        }

        Err(ConnectError::AllCandidatesFailed(attempted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    use crate::rate_limit::RateLimitConfig;
    use crate::transport::{DialerStats, DialerStatsSnapshot};

    fn endpoint(t: TransportType, host: &str, preference: i32, cost: i32) -> TransportEndpoint {
        TransportEndpoint {
            transport_type: t,
            host: host.to_string(),
            port: 1,
            scope: Scope::ControlAndData,
            preference,
            cost,
            valid_from: None,
            valid_to: None,
        }
    }

    fn descriptor(endpoints: Vec<TransportEndpoint>) -> PeerDescriptor {
        PeerDescriptor {
            peer_id: "peer-a".to_string(),
            sequence_number: 1,
            expires_at: now_ms() + 60_000,
            endpoints,
            certificate_pins: BTreeSet::new(),
            control_signing_keys: BTreeSet::new(),
            signature: [0u8; 64],
        }
    }

    #[test]
    fn filters_by_local_transports_and_policy_allow_list() {
        let d = descriptor(vec![
            endpoint(TransportType::DirectQuic, "a", 0, 0),
            endpoint(TransportType::TorOnionQuic, "b", 0, 0),
        ]);
        let mut policy = TransportPolicy::allow_all(PolicyScope::Global);
        policy.allowed_transports = [TransportType::TorOnionQuic].into_iter().collect();
        let history = TrustHistory::new();

        let result = select_candidates(
            &d,
            &policy,
            &[TransportType::DirectQuic, TransportType::TorOnionQuic],
            Scope::ControlAndData,
            &history,
            "peer-a",
            now_ms(),
        )
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].transport_type, TransportType::TorOnionQuic);
    }

    #[test]
    fn forbid_clearnet_is_fail_closed_not_a_fallback() {
        let d = descriptor(vec![endpoint(TransportType::DirectQuic, "a", 0, 0)]);
        let mut policy = TransportPolicy::allow_all(PolicyScope::Global);
        policy.forbid_clearnet = true;
        let history = TrustHistory::new();

        let err = select_candidates(
            &d,
            &policy,
            &[TransportType::DirectQuic],
            Scope::ControlAndData,
            &history,
            "peer-a",
            now_ms(),
        )
        .unwrap_err();
        assert_eq!(err, PolicyError::NoAcceptableTransport);
    }

    #[test]
    fn prefer_private_boosts_ordering_ahead_of_lower_cost_clearnet() {
        let d = descriptor(vec![
            endpoint(TransportType::DirectQuic, "clearnet", 0, 0),
            endpoint(TransportType::TorOnionQuic, "onion", 5, 0),
        ]);
        let mut policy = TransportPolicy::allow_all(PolicyScope::Global);
        policy.prefer_private = true;
        let history = TrustHistory::new();

        let result = select_candidates(
            &d,
            &policy,
            &[TransportType::DirectQuic, TransportType::TorOnionQuic],
            Scope::ControlAndData,
            &history,
            "peer-a",
            now_ms(),
        )
        .unwrap();
        assert_eq!(result[0].host, "onion");
    }

    #[test]
    fn expired_validity_window_excludes_endpoint() {
        let mut e = endpoint(TransportType::DirectQuic, "a", 0, 0);
        e.valid_to = Some(1000);
        let d = descriptor(vec![e]);
        let policy = TransportPolicy::allow_all(PolicyScope::Global);
        let history = TrustHistory::new();

        let err = select_candidates(
            &d,
            &policy,
            &[TransportType::DirectQuic],
            Scope::ControlAndData,
            &history,
            "peer-a",
            2000,
        )
        .unwrap_err();
        assert_eq!(err, PolicyError::NoAcceptableTransport);
    }

    #[test]
    fn downgrade_protection_rejects_clearnet_once_private_has_succeeded() {
        let d = descriptor(vec![
            endpoint(TransportType::DirectQuic, "clearnet", 0, 0),
            endpoint(TransportType::TorOnionQuic, "onion", 0, 0),
        ]);
        let policy = TransportPolicy::allow_all(PolicyScope::Global);
        let history = TrustHistory::new();
        history.record_attempt("peer-a", SecurityLevel::Private, true);

        let result = select_candidates(
            &d,
            &policy,
            &[TransportType::DirectQuic, TransportType::TorOnionQuic],
            Scope::ControlAndData,
            &history,
            "peer-a",
            now_ms(),
        )
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].transport_type, TransportType::TorOnionQuic);
    }

    #[test]
    fn downgrade_protection_allows_exception_when_nothing_higher_remains() {
        let d = descriptor(vec![endpoint(TransportType::DirectQuic, "clearnet", 0, 0)]);
        let policy = TransportPolicy::allow_all(PolicyScope::Global);
        let history = TrustHistory::new();
        history.record_attempt("peer-a", SecurityLevel::Private, true);

        let result = select_candidates(
            &d,
            &policy,
            &[TransportType::DirectQuic],
            Scope::ControlAndData,
            &history,
            "peer-a",
            now_ms(),
        )
        .unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn attack_pattern_signal_detects_private_failure_then_clearnet_success() {
        let history = TrustHistory::new();
        history.record_attempt("peer-a", SecurityLevel::Private, false);
        history.record_attempt("peer-a", SecurityLevel::Clearnet, true);
        assert!(history.attack_pattern_signal("peer-a"));
    }

    #[test]
    fn attack_pattern_signal_is_false_for_normal_history() {
        let history = TrustHistory::new();
        history.record_attempt("peer-a", SecurityLevel::Private, true);
        history.record_attempt("peer-a", SecurityLevel::Clearnet, true);
        assert!(!history.attack_pattern_signal("peer-a"));
    }

    #[test]
    fn policy_registry_resolves_most_specific_scope() {
        let registry = PolicyRegistry::new(vec![
            TransportPolicy::allow_all(PolicyScope::Global),
            {
                let mut p = TransportPolicy::allow_all(PolicyScope::Peer("peer-a".to_string()));
                p.forbid_clearnet = true;
                p
            },
        ]);
        let resolved = registry.resolve("peer-a", None);
        assert!(resolved.forbid_clearnet);
        let fallback = registry.resolve("peer-b", None);
        assert!(!fallback.forbid_clearnet);
    }

    struct StubDialer {
        succeed: bool,
        stats: DialerStats,
    }

    #[async_trait]
    impl Dialer for StubDialer {
        fn can_handle(&self, _endpoint: &str) -> bool {
            true
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn dial(
            &self,
            _endpoint: &str,
            _peer_id: &str,
            _isolation_key: Option<&[u8]>,
        ) -> Result<DialerStream, DialError> {
            if self.succeed {
                let (a, _b) = tokio::io::duplex(64);
                Ok(Box::new(a))
            } else {
                Err(DialError::Unavailable)
            }
        }

        fn stats(&self) -> DialerStatsSnapshot {
            self.stats.snapshot()
        }
    }

    #[tokio::test]
    async fn connect_falls_through_to_the_next_candidate_on_failure() {
        let d = descriptor(vec![
            endpoint(TransportType::TorOnionQuic, "onion", 0, 0),
            endpoint(TransportType::DirectQuic, "clearnet", 1, 0),
        ]);
        let registry = PolicyRegistry::new(vec![]);
        let throttler = Arc::new(Throttler::new(RateLimitConfig::default()));
        let dialers: Vec<(TransportType, Arc<dyn Dialer>)> = vec![
            (
                TransportType::TorOnionQuic,
                Arc::new(StubDialer {
                    succeed: false,
                    stats: DialerStats::default(),
                }),
            ),
            (
                TransportType::DirectQuic,
                Arc::new(StubDialer {
                    succeed: true,
                    stats: DialerStats::default(),
                }),
            ),
        ];
        let selector = TransportSelector::new(registry, throttler, dialers);

        let (transport, _stream) = selector
            .connect("peer-a", &d, None, Scope::ControlAndData, None)
            .await
            .unwrap();
        assert_eq!(transport, TransportType::DirectQuic);
    }
}
