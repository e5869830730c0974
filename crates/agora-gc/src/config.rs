use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tombstone collection policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TombstoneConfig {
    /// Minimum age of a deletion before it is considered.
    pub age_threshold_secs: u64,
    /// Consecutive qualifying passes required before erasure.
    pub min_stable_passes: u32,
    /// Candidates examined per pass.
    pub batch_limit: usize,
    /// Pause between background passes.
    pub interval_secs: u64,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            age_threshold_secs: 30 * 24 * 60 * 60, // 30 days
            min_stable_passes: 2,
            batch_limit: 100,
            interval_secs: 10 * 60,
        }
    }
}

impl TombstoneConfig {
    pub fn age_threshold(&self) -> Duration {
        Duration::from_secs(self.age_threshold_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}
