//! Worker configuration

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Job worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Max trip polls running at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How often the queue is checked for due jobs
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Attempts per job before it is marked failed
    #[serde(rename = "max-attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay, doubled per attempt
    #[serde(rename = "backoff-ms", default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Upper bound for the retry delay
    #[serde(rename = "max-backoff-ms", default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Completed jobs kept after pruning
    #[serde(rename = "keep-completed", default = "default_keep_completed")]
    pub keep_completed: usize,

    /// Failed jobs kept after pruning
    #[serde(rename = "keep-failed", default = "default_keep_failed")]
    pub keep_failed: usize,
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_keep_completed() -> usize {
    1
}

fn default_keep_failed() -> usize {
    50
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            keep_completed: default_keep_completed(),
            keep_failed: default_keep_failed(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Exponential delay before retry number `attempt` (1-based), without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Retry delay with up to 25% random jitter added
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let spread = (base.as_millis() / 4) as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::rng().random_range(0..=spread)
        };
        base + Duration::from_millis(jitter)
    }
}
