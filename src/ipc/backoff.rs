// src/ipc/backoff.rs

//! Exponential backoff with full jitter for hub-client reconnection delays.
//!
//! Follows the AWS "Full Jitter" strategy:
//! `delay = random(0, min(cap, base * 2^attempt))`.

use std::time::Duration;

pub(crate) struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            attempt: 0,
        }
    }

    /// Compute the next delay with full jitter and advance the attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(self.attempt).unwrap_or(u64::MAX));
        let capped = exp.min(self.max_ms);
        let jittered = if capped == 0 { 0 } else { fastrand::u64(0..=capped) };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered)
    }

    /// Reset the attempt counter after a successful connection.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}
