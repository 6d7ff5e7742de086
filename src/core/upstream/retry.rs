//! Bounded retry policy for upstream connection attempts.
//!
//! Connect and reconnect behavior is driven by an explicit policy object so
//! it can be tuned per deployment and tested without real network timing.

use serde::{Deserialize, Serialize};

/// Retry policy for connect and reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up.
    /// Default: 3
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds).
    /// Default: 1000ms
    pub initial_delay_ms: u64,

    /// Upper bound on the backoff delay (milliseconds).
    /// Default: 30000ms
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    /// Default: 2.0
    pub backoff_multiplier: f32,

    /// Whether to add jitter to the delay to prevent thundering herd.
    /// Default: true
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt and never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay in milliseconds before the given attempt number
    /// (1-based: `delay_for(1)` is the wait before the second try).
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let base = self.initial_delay_ms as f64;
        let multiplier = self.backoff_multiplier as f64;

        let delay = base * multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = delay.min(self.max_delay_ms as f64);

        if self.jitter {
            // Up to 25% jitter either way
            let jitter_range = delay * 0.25;
            (delay + rand_jitter(jitter_range)).max(0.0) as u64
        } else {
            delay as u64
        }
    }
}

/// Generate a pseudo-random jitter value using a simple LCG.
/// This avoids pulling in the rand crate for a simple use case.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = ((seed.wrapping_mul(1103515245).wrapping_add(12345)) % (1 << 31)) as f64;
    let normalized = random / (1u64 << 31) as f64; // 0.0 to 1.0
    (normalized - 0.5) * 2.0 * range // -range to +range
}
