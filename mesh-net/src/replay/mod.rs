//! Replay Cache (§4.10): dedup of signed control envelopes by message
//! identifier, grounded on this codebase's nonce-cache idiom (atomic
//! check-and-insert, TTL window, background sweep) but in-memory only —
//! control-envelope replay windows are short-lived and don't need the
//! nonce cache's cross-restart persistence.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(300);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// Bounded map from message id to first-seen timestamp. `is_replay` is the
/// sole entry point: it atomically checks and inserts so two threads
/// racing on the same id can't both see "new".
pub struct ReplayCache {
    seen: DashMap<Vec<u8>, i64>,
    capacity: usize,
    window: Duration,
}

impl ReplayCache {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            capacity,
            window,
        }
    }

    /// Returns `true` if `id` was already seen within the replay window
    /// (a replay), or `false` if it is new (and is now recorded as seen).
    pub fn is_replay(&self, id: &[u8]) -> bool {
        let now = now_ms();
        let window_ms = self.window.as_millis() as i64;

        if let Some(mut first_seen) = self.seen.get_mut(id) {
            if now - *first_seen <= window_ms {
                return true;
            }
            *first_seen = now;
            return false;
        }

        self.seen.insert(id.to_vec(), now);
        if self.seen.len() > (self.capacity * 9) / 10 {
            self.sweep();
        }
        false
    }

    /// Removes all entries older than the replay window.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let window_ms = self.window.as_millis() as i64;
        let before = self.seen.len();
        self.seen.retain(|_, first_seen| now - *first_seen <= window_ms);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }
}
