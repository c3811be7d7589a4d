//! Transport Dialers (C7): direct QUIC, Tor SOCKS5, and I2P SOCKS5, behind
//! a common `Dialer` trait with running per-dialer statistics.

pub mod direct_quic;
pub mod i2p;
pub mod socks5;
pub mod tor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use direct_quic::DirectQuicDialer;
pub use i2p::I2pSocks5Dialer;
pub use tor::TorSocks5Dialer;

/// A duplex byte stream to a peer, returned by a successful dial.
pub type DialerStream = Box<dyn AsyncReadWrite + Send + Unpin>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[derive(Debug, Clone, Copy, Default)]
pub struct DialerStatsSnapshot {
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub active: u64,
    pub avg_connect_ms: f64,
}

/// Running counters for a dialer (§4.7). Cheap to share via `Arc` across
/// concurrent dial attempts.
#[derive(Default)]
pub struct DialerStats {
    total_attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    active: AtomicU64,
    total_connect_ms: AtomicU64,
    last_error: parking_lot::Mutex<Option<String>>,
}

impl DialerStats {
    pub fn snapshot(&self) -> DialerStatsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let total_connect_ms = self.total_connect_ms.load(Ordering::Relaxed);
        DialerStatsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            avg_connect_ms: if successes == 0 {
                0.0
            } else {
                total_connect_ms as f64 / successes as f64
            },
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_attempt(&self) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self, elapsed: Instant) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total_connect_ms
            .fetch_add(elapsed.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, error: impl Into<String>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.into());
    }

    /// Called when the stream returned by `dial` is disposed, decrementing
    /// the active-connection gauge exactly once.
    pub fn record_close(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("endpoint is not handled by this dialer")]
    Unsupported,
    #[error("dialer is not currently available")]
    Unavailable,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("certificate pin mismatch")]
    PinMismatch,
    #[error("proxy handshake failed: {0}")]
    Proxy(#[from] socks5::Socks5Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Common interface implemented by every transport dialer (§4.7).
#[async_trait]
pub trait Dialer: Send + Sync {
    fn can_handle(&self, endpoint: &str) -> bool;
    fn is_available(&self) -> bool;
    async fn dial(
        &self,
        endpoint: &str,
        peer_id: &str,
        isolation_key: Option<&[u8]>,
    ) -> Result<DialerStream, DialError>;
    fn stats(&self) -> DialerStatsSnapshot;
}
