//! Health Reporter collaborator (§6): the core notifies this of every
//! connection attempt's outcome so a caller can track per-peer/transport
//! health without reaching into the selector internals. `spec.md` defines
//! only the interface; this ships the default implementations a running
//! node actually needs.

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::info;

const SAMPLES_PER_PEER: usize = 20;

#[derive(Debug, Clone)]
pub struct HealthSample {
    pub transport: &'static str,
    pub latency_ms: u64,
    pub error_class: Option<&'static str>,
}

pub trait HealthReporter: Send + Sync {
    fn report(&self, peer_id: &str, sample: HealthSample);
}

/// Logs every report and keeps a bounded ring buffer of recent samples per
/// peer, queryable for diagnostics.
#[derive(Default)]
pub struct LoggingHealthReporter {
    samples: DashMap<String, VecDeque<HealthSample>>,
}

impl LoggingHealthReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recent(&self, peer_id: &str) -> Vec<HealthSample> {
        self.samples
            .get(peer_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl HealthReporter for LoggingHealthReporter {
    fn report(&self, peer_id: &str, sample: HealthSample) {
        info!(
            peer_id = %crate::redact::mask_peer_id(peer_id),
            transport = sample.transport,
            latency_ms = sample.latency_ms,
            error_class = sample.error_class.unwrap_or("none"),
            "connection attempt health report"
        );
        let mut entry = self.samples.entry(peer_id.to_string()).or_default();
        if entry.len() >= SAMPLES_PER_PEER {
            entry.pop_front();
        }
        entry.push_back(sample);
    }
}

/// For embedding contexts that supply their own health tracking.
pub struct NullHealthReporter;

impl HealthReporter for NullHealthReporter {
    fn report(&self, _peer_id: &str, _sample: HealthSample) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_reporter_keeps_bounded_recent_samples() {
        let reporter = LoggingHealthReporter::new();
        for i in 0..SAMPLES_PER_PEER + 5 {
            reporter.report(
                "peer1",
                HealthSample {
                    transport: "direct-quic",
                    latency_ms: i as u64,
                    error_class: None,
                },
            );
        }
        let recent = reporter.recent("peer1");
        assert_eq!(recent.len(), SAMPLES_PER_PEER);
        // Oldest samples were evicted; the buffer holds the most recent ones.
        assert_eq!(recent.first().unwrap().latency_ms, 5);
        assert_eq!(recent.last().unwrap().latency_ms, (SAMPLES_PER_PEER + 4) as u64);
    }

    #[test]
    fn null_reporter_accepts_reports_without_storing_anything() {
        let reporter = NullHealthReporter;
        reporter.report(
            "peer1",
            HealthSample {
                transport: "tor-socks5",
                latency_ms: 10,
                error_class: Some("timeout"),
            },
        );
    }
}
