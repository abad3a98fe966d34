//! Pacing for mutated requests.
//!
//! Each attempt waits for an optional fixed delay plus an adaptive backoff
//! that grows on 429/403 answers and decays on normal ones. State is kept in
//! atomics so scan workers never contend on a lock.
//!
//! Backoff: 0 → 50 → 100 → 200 → ... → 2000ms cap.
//! Decay: -10ms per normal response, floors at 0.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};
use tokio::time::{sleep, Duration};

const MAX_BACKOFF_MS: u64 = 2000;
const INITIAL_BACKOFF_MS: u64 = 50;
const DECAY_MS: u64 = 10;

pub struct Throttle {
    fixed_delay_ms: AtomicU64,
    backoff_ms: AtomicU64,
    consecutive_blocks: AtomicU32,
    total_blocked: AtomicU64,
}

impl Throttle {
    pub fn new(fixed_delay_ms: u64) -> Self {
        Self {
            fixed_delay_ms: AtomicU64::new(fixed_delay_ms),
            backoff_ms: AtomicU64::new(0),
            consecutive_blocks: AtomicU32::new(0),
            total_blocked: AtomicU64::new(0),
        }
    }

    pub fn set_fixed_delay(&self, ms: u64) {
        self.fixed_delay_ms.store(ms, Relaxed);
    }

    /// Milliseconds the next attempt will wait.
    pub fn current_delay_ms(&self) -> u64 {
        self.fixed_delay_ms.load(Relaxed) + self.backoff_ms.load(Relaxed)
    }

    /// Sleeps for the current delay. No-op when it is 0.
    pub async fn pace(&self) {
        let ms = self.current_delay_ms();
        if ms > 0 {
            sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Feeds a response status back. Returns true if it escalated the backoff.
    pub fn record_status(&self, status: u16) -> bool {
        if status == 429 || status == 403 {
            let blocks = self.consecutive_blocks.fetch_add(1, Relaxed) + 1;
            self.total_blocked.fetch_add(1, Relaxed);
            let backoff = (INITIAL_BACKOFF_MS << (blocks - 1).min(6)).min(MAX_BACKOFF_MS);
            self.backoff_ms.store(backoff, Relaxed);
            true
        } else {
            self.consecutive_blocks.store(0, Relaxed);
            let _ = self
                .backoff_ms
                .fetch_update(Relaxed, Relaxed, |ms| (ms > 0).then(|| ms.saturating_sub(DECAY_MS)));
            false
        }
    }

    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(Relaxed)
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(0)
    }
}
