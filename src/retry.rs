//! Retry policy: whether to retry a failed message and how long to wait
//!
//! Delays are whole seconds because they end up as queue TTLs
//! (`x-message-ttl = delay * 1000`).
//!
//! ## Presets
//!
//! | Preset | Retries | Initial | Multiplier | Cap |
//! |---|---|---|---|---|
//! | `default()` | 3 | 1s | 2.0 | 300s |
//! | `no_retry()` | 0 | 1s | 2.0 | 300s |
//! | `aggressive()` | 10 | 1s | 1.5 | 600s |

use serde::{Deserialize, Serialize};

/// Stateless retry/backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = never retry)
    pub max_retries: u32,
    /// Delay before the first retry, in seconds
    pub initial_delay_secs: u64,
    /// Growth factor applied per retry when `exponential_backoff` is set
    pub backoff_multiplier: f64,
    /// Hard ceiling for any computed delay, in seconds
    pub max_delay_secs: u64,
    /// Use `initial * multiplier^n`; otherwise always `initial`
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_secs: 1,
            backoff_multiplier: 2.0,
            max_delay_secs: 300,
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that dead-letters on the first failure
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Many retries with gentle growth, for flaky downstreams
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            initial_delay_secs: 1,
            backoff_multiplier: 1.5,
            max_delay_secs: 600,
            exponential_backoff: true,
        }
    }

    /// True iff `retry_count < max_retries`
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay in seconds before redelivering a message that has already been
    /// retried `retry_count` times
    ///
    /// `min(max_delay, floor(initial * multiplier^retry_count))`, or `initial`
    /// when exponential backoff is off.
    pub fn delay_for(&self, retry_count: u32) -> u64 {
        if !self.exponential_backoff {
            return self.initial_delay_secs;
        }

        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let raw = self.initial_delay_secs as f64 * self.backoff_multiplier.max(1.0).powi(exponent);

        // `as` saturates on overflow and maps NaN to 0
        let delay = raw.floor() as u64;
        delay.min(self.max_delay_secs)
    }

    /// Delay as a `Duration`
    pub fn delay_duration(&self, retry_count: u32) -> std::time::Duration {
        std::time::Duration::from_secs(self.delay_for(retry_count))
    }
}
