//! Exponential backoff with bounded additive jitter.

use crate::types::FeedConfig;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Retry delay policy for the reconnect loop. Delays grow by `factor` per
/// failed cycle up to `cap`, plus a uniform jitter in `[0, jitter_cap)` so
/// that many clients do not retry in lockstep. `reset` is called exactly
/// once per successful transition into Connected.
#[derive(Debug)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter_cap: Duration,
    attempt: u32,
    rng_state: u64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, factor: f64, jitter_cap: Duration) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e37_79b9_7f4a_7c15);

        Self {
            base,
            cap,
            factor,
            jitter_cap,
            attempt: 0,
            rng_state: seed | 1,
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.backoff_factor,
            Duration::from_millis(config.jitter_ms),
        )
    }

    // xorshift64; cheap and good enough for retry jitter.
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let grown = base_ms * self.factor.powi(self.attempt.min(32) as i32);
        let capped = grown.min(self.cap.as_millis() as f64);
        let jitter = self.next_random() * self.jitter_cap.as_millis() as f64;

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((capped + jitter) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
