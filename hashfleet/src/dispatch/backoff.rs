//! Retry pacing for device writes.

use std::hash::{BuildHasher, Hasher};
use std::collections::hash_map::RandomState;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many times a transient failure is retried, and how far apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.initial_delay, self.max_delay)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Exponential backoff with jitter.
#[derive(Debug)]
pub struct ExponentialBackoff {
    current: Duration,
    initial: Duration,
    max: Duration,
    // RandomState is seeded from OS randomness, so devices retried at the
    // same instant by different processes do not line up.
    jitter_state: RandomState,
    jitter_step: u64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
            jitter_state: RandomState::new(),
            jitter_step: 0,
        }
    }

    /// Return the next delay and advance.
    ///
    /// The nominal delay (1s, 2s, 4s, ...) is scaled by a jitter factor
    /// in [0.5, 1.0].
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.current;
        self.current = (self.current * 2).min(self.max);

        let mut hasher = self.jitter_state.build_hasher();
        hasher.write_u64(self.jitter_step);
        self.jitter_step = self.jitter_step.wrapping_add(1);
        let hash = hasher.finish();
        let jitter = 0.5 + (hash as f64 / u64::MAX as f64) * 0.5;

        nominal.mul_f64(jitter)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
