//! Privacy Layer (§4.13): padding, timing jitter, batching, and cover
//! traffic applied to outbound bytes. All four are independently
//! toggleable. No direct teacher precedent exists for traffic-shaping
//! code in this codebase; built in the crate's established idiom
//! (`rand`'s `OsRng` for fill bytes, as mesh-crypto already uses it;
//! `thiserror` for errors; `tokio::time` for delays).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use thiserror::Error;

const LEN_PREFIX_BYTES: usize = 4;
const MARKER_REAL: u8 = 0x00;
const MARKER_COVER: u8 = 0x01;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrivacyError {
    #[error("frame too short to contain a length prefix")]
    Truncated,
    #[error("declared length {declared} exceeds available {available} bytes")]
    LengthMismatch { declared: usize, available: usize },
    #[error("unknown frame marker byte {0:#x}")]
    UnknownMarker(u8),
}

/// Pads `data` to the smallest configured bucket size, preceded by an
/// explicit `u32` length field so padding can be reversed. If `data` (plus
/// the length prefix) exceeds every bucket, pads only to its own size.
pub fn pad(data: &[u8], buckets: &[usize]) -> Vec<u8> {
    let needed = data.len() + LEN_PREFIX_BYTES;
    let target = buckets
        .iter()
        .copied()
        .filter(|&b| b >= needed)
        .min()
        .unwrap_or(needed);

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    let fill = target.saturating_sub(out.len());
    let mut random_tail = vec![0u8; fill];
    OsRng.fill_bytes(&mut random_tail);
    out.extend_from_slice(&random_tail);
    out
}

/// Reverses [`pad`]: reads the length prefix and returns exactly the
/// original bytes, discarding the random tail.
pub fn unpad(framed: &[u8]) -> Result<Vec<u8>, PrivacyError> {
    if framed.len() < LEN_PREFIX_BYTES {
        return Err(PrivacyError::Truncated);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&framed[..LEN_PREFIX_BYTES]);
    let declared = u32::from_be_bytes(len_bytes) as usize;
    let available = framed.len() - LEN_PREFIX_BYTES;
    if declared > available {
        return Err(PrivacyError::LengthMismatch { declared, available });
    }
    Ok(framed[LEN_PREFIX_BYTES..LEN_PREFIX_BYTES + declared].to_vec())
}

/// Returns a random delay in `[min, max]`, to be awaited via
/// `tokio::time::sleep` by the caller before an outbound write.
pub fn jitter_delay(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let span_ms = (max.as_millis() - min.as_millis()) as u64;
    min + Duration::from_millis(OsRng.gen_range(0..=span_ms))
}

/// Coalesces outbound messages within a time window up to a max batch
/// size; flushes when either condition triggers.
pub struct Batcher {
    max_batch: usize,
    window: Duration,
    queue: VecDeque<Vec<u8>>,
    window_started: Option<Instant>,
}

impl Batcher {
    pub fn new(max_batch: usize, window: Duration) -> Self {
        Self {
            max_batch,
            window,
            queue: VecDeque::new(),
            window_started: None,
        }
    }

    /// Adds a message to the pending batch. Returns `Some(batch)` if the
    /// max batch size was just reached.
    pub fn push(&mut self, message: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        if self.queue.is_empty() {
            self.window_started = Some(Instant::now());
        }
        self.queue.push_back(message);
        if self.queue.len() >= self.max_batch {
            return Some(self.drain());
        }
        None
    }

    /// Returns `Some(batch)` if the window has elapsed and there's
    /// anything pending; call this periodically from a timer.
    pub fn poll_window(&mut self) -> Option<Vec<Vec<u8>>> {
        let started = self.window_started?;
        if started.elapsed() >= self.window && !self.queue.is_empty() {
            Some(self.drain())
        } else {
            None
        }
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.window_started = None;
        self.queue.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }
}

/// Emits marker-prefixed dummy messages at a noisy interval, suppressed
/// when real traffic was recorded within the last interval.
pub struct CoverTraffic {
    base: Duration,
    jitter: Duration,
    last_real_activity: Instant,
    last_emitted: Option<Instant>,
}

const MIN_COVER_INTERVAL: Duration = Duration::from_secs(1);

impl CoverTraffic {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        Self {
            base: base.max(MIN_COVER_INTERVAL),
            jitter,
            last_real_activity: Instant::now(),
            last_emitted: None,
        }
    }

    pub fn record_real_activity(&mut self) {
        self.last_real_activity = Instant::now();
    }

    fn next_interval(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }
        let span_ms = self.jitter.as_millis() as u64;
        self.base + Duration::from_millis(OsRng.gen_range(0..=span_ms))
    }

    /// Returns `Some(cover_frame)` if enough time has passed since the
    /// last emission and no real activity happened within the interval.
    pub fn maybe_emit(&mut self) -> Option<Vec<u8>> {
        let interval = self.next_interval();
        let due = match self.last_emitted {
            Some(t) => t.elapsed() >= interval,
            None => true,
        };
        if !due {
            return None;
        }
        if self.last_real_activity.elapsed() < interval {
            return None;
        }
        self.last_emitted = Some(Instant::now());
        Some(make_cover_frame())
    }
}

#[derive(Debug)]
pub enum Frame {
    Real(Vec<u8>),
    Cover,
}

pub fn wrap_real(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(MARKER_REAL);
    out.extend_from_slice(payload);
    out
}

fn make_cover_frame() -> Vec<u8> {
    vec![MARKER_COVER]
}

/// Inbound peers use this to recognize and drop cover frames before
/// delivery to higher layers.
pub fn unwrap_frame(frame: &[u8]) -> Result<Frame, PrivacyError> {
    match frame.first() {
        Some(&MARKER_REAL) => Ok(Frame::Real(frame[1..].to_vec())),
        Some(&MARKER_COVER) => Ok(Frame::Cover),
        Some(&other) => Err(PrivacyError::UnknownMarker(other)),
        None => Err(PrivacyError::Truncated),
    }
}
