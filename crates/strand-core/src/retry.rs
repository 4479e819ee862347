//! Retry/backoff policy.
//!
//! Exponential backoff with jitter, used by the error classifier for
//! transient execution errors and by the store for SQLITE_BUSY retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration for a retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum attempts (including the first).
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Delay multiplier per attempt.
    pub multiplier: f64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the given (1-based) retry attempt, with ±25% jitter
    /// to avoid thundering herds.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let jitter_range = base / 4.0;
        let jitter = if jitter_range > 0.0 {
            rand::random::<f64>() * 2.0 * jitter_range - jitter_range
        } else {
            0.0
        };
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_three_attempts() {
        let cfg = RetryConfig::default();
        assert!(cfg.should_retry(0));
        assert!(cfg.should_retry(2));
        assert!(!cfg.should_retry(3));
    }

    #[test]
    fn delay_grows_exponentially_within_jitter() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 10_000,
        };
        // attempt 1: base 100ms ± 25ms, attempt 3: base 400ms ± 100ms
        let d1 = cfg.delay_for_attempt(1).as_millis() as f64;
        let d3 = cfg.delay_for_attempt(3).as_millis() as f64;
        assert!((75.0..=125.0).contains(&d1), "d1 = {d1}");
        assert!((300.0..=500.0).contains(&d3), "d3 = {d3}");
    }

    #[test]
    fn delay_capped_at_max() {
        let cfg = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1000,
            multiplier: 10.0,
            max_delay_ms: 2000,
        };
        let d = cfg.delay_for_attempt(8).as_millis();
        // max 2000 + 25% jitter
        assert!(d <= 2500, "d = {d}");
    }
}
