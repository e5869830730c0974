use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Cumulative anti-entropy counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub rounds: u64,
    pub sync_requests_sent: u64,
    pub sync_responses_received: u64,
    pub digests_received: u64,
    pub index_insertions: u64,
    pub blob_fetch_attempts: u64,
    pub blob_fetch_successes: u64,
    pub blob_fetch_failures: u64,
    /// Unix seconds of the last response received.
    pub last_sync_at: Option<u64>,
    /// Newest timestamp seen in any peer digest.
    pub last_remote_max_timestamp: Option<u64>,
    /// Local clock minus `last_remote_max_timestamp` at the time it was seen.
    pub last_observed_lag_secs: Option<u64>,
}

/// Point-in-time view of the remote body fetcher.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub no_peers: u64,
    pub timeouts: u64,
    /// Fetches answered by a concurrent fetch of the same content.
    pub coalesced: u64,
    pub p95_latency_ms: Option<u64>,
}

/// Bounded window of recent latencies.
#[derive(Clone, Debug)]
pub struct LatencyRing {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyRing {
    pub const DEFAULT_CAPACITY: usize = 512;

    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, millis: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 95th percentile of the retained samples.
    pub fn p95(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = (sorted.len() * 95 - 1) / 100;
        sorted.get(idx).copied()
    }
}

impl Default for LatencyRing {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
