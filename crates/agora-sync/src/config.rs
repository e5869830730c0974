use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const MAX_BATCH_SIZE: u32 = 500;
pub const MAX_INDEX_BUDGET: usize = 1000;
pub const MAX_BODY_BUDGET: usize = 200;
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Anti-entropy settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Pause between rounds.
    pub interval_secs: u64,
    /// Delay before the first round after start.
    pub initial_delay_ms: u64,
    /// Trailing window, measured back from the newest local timestamp.
    pub window_secs: u64,
    /// Digests asked of each peer per round; also the cap a responder serves.
    pub batch_size: u32,
    /// Digests applied per round.
    pub index_budget: usize,
    /// Body fetches started per round.
    pub body_budget: usize,
    /// Timeout of one digest request.
    pub request_timeout_ms: u64,
    /// Timeout of one body fetch started by a round.
    pub blob_fetch_timeout_ms: u64,
    /// Sync or content requests served to one peer per rate window, each.
    pub request_limit: u32,
    /// Publishes accepted from one peer per rate window.
    pub publish_limit: u32,
    pub rate_window_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 12,
            initial_delay_ms: 2_000,
            window_secs: 30 * 24 * 60 * 60,
            batch_size: 200,
            index_budget: 240,
            body_budget: 16,
            request_timeout_ms: 3_000,
            blob_fetch_timeout_ms: 3_000,
            request_limit: 60,
            publish_limit: 240,
            rate_window_secs: 60,
        }
    }
}

impl SyncConfig {
    /// Clamp budgets into their supported ranges.
    pub fn clamped(mut self) -> Self {
        self.interval_secs = self.interval_secs.max(1);
        self.batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        self.index_budget = self.index_budget.clamp(1, MAX_INDEX_BUDGET);
        self.body_budget = self.body_budget.min(MAX_BODY_BUDGET);
        self.request_limit = self.request_limit.max(1);
        self.publish_limit = self.publish_limit.max(1);
        self.rate_window_secs = self.rate_window_secs.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn blob_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.blob_fetch_timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs.max(1))
    }
}

/// Remote body fetch settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Deadline of a body read that misses locally.
    pub timeout_ms: u64,
    /// Attempts per read, including the first.
    pub retry_attempts: u32,
    /// Pause between attempts.
    pub retry_delay_ms: u64,
    /// Peers asked concurrently per attempt.
    pub fanout: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 4_000,
            retry_attempts: 1,
            retry_delay_ms: 150,
            fanout: 3,
        }
    }
}

impl FetchConfig {
    pub fn clamped(mut self) -> Self {
        self.retry_attempts = self.retry_attempts.clamp(1, MAX_RETRY_ATTEMPTS);
        self.fanout = self.fanout.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
