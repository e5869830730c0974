use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use agora_gc::TombstoneConfig;
use agora_store::{QuotaConfig, WalConfig};
use agora_sync::{FetchConfig, SyncConfig};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{NodeError, NodeResult};

/// Local HTTP API settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
        }
    }
}

/// Everything a node needs to run. Missing keys take their defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Peer id on the network; also the author key of local writes.
    pub node_id: String,
    /// Directory of the durable entity log. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub wal: WalConfig,
    pub quota: QuotaConfig,
    pub sync: SyncConfig,
    pub fetch: FetchConfig,
    pub tombstone: TombstoneConfig,
    pub server: ApiConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "agora-local".into(),
            data_dir: None,
            wal: WalConfig::default(),
            quota: QuotaConfig::default(),
            sync: SyncConfig::default(),
            fetch: FetchConfig::default(),
            tombstone: TombstoneConfig::default(),
            server: ApiConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> NodeResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML file.
    pub fn load(path: &Path) -> NodeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> NodeResult<String> {
        toml::to_string_pretty(self).map_err(|e| NodeError::Config(e.to_string()))
    }

    /// Apply `AGORA_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply `AGORA_*` overrides from `lookup`. Unparsable values are
    /// ignored with a warning.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("AGORA_NODE_ID").filter(|v| !v.trim().is_empty()) {
            self.node_id = id.trim().to_string();
        }
        if let Some(dir) = lookup("AGORA_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(dir.trim()));
        }
        override_from(&lookup, "AGORA_SYNC_INTERVAL_SECS", &mut self.sync.interval_secs);
        override_from(&lookup, "AGORA_SYNC_WINDOW_SECS", &mut self.sync.window_secs);
        override_from(&lookup, "AGORA_SYNC_BATCH_SIZE", &mut self.sync.batch_size);
        override_from(&lookup, "AGORA_SYNC_INDEX_BUDGET", &mut self.sync.index_budget);
        override_from(&lookup, "AGORA_SYNC_BODY_BUDGET", &mut self.sync.body_budget);
        override_from(&lookup, "AGORA_REQUEST_LIMIT", &mut self.sync.request_limit);
        override_from(&lookup, "AGORA_PUBLISH_LIMIT", &mut self.sync.publish_limit);
        override_from(&lookup, "AGORA_RATE_WINDOW_SECS", &mut self.sync.rate_window_secs);
        override_from(&lookup, "AGORA_FETCH_RETRY_ATTEMPTS", &mut self.fetch.retry_attempts);
        override_from(&lookup, "AGORA_FETCH_TIMEOUT_MS", &mut self.fetch.timeout_ms);
        override_from(&lookup, "AGORA_PRIVATE_QUOTA_BYTES", &mut self.quota.private_bytes);
        override_from(&lookup, "AGORA_PUBLIC_QUOTA_BYTES", &mut self.quota.public_bytes);
        override_from(&lookup, "AGORA_GC_AGE_SECS", &mut self.tombstone.age_threshold_secs);
        override_from(&lookup, "AGORA_GC_MIN_STABLE_PASSES", &mut self.tombstone.min_stable_passes);
        override_from(&lookup, "AGORA_GC_BATCH_LIMIT", &mut self.tombstone.batch_limit);
        override_from(&lookup, "AGORA_BIND_ADDR", &mut self.server.bind_addr);
    }

    /// Clamp budgets into range and reject settings a node cannot run with.
    pub fn validate(mut self) -> NodeResult<Self> {
        self.node_id = self.node_id.trim().to_string();
        if self.node_id.is_empty() {
            return Err(NodeError::Config("node_id must not be empty".into()));
        }
        if self.quota.private_bytes == 0 || self.quota.public_bytes == 0 {
            return Err(NodeError::Config("zone quotas must be positive".into()));
        }
        if self.tombstone.batch_limit == 0 {
            return Err(NodeError::Config("tombstone.batch_limit must be positive".into()));
        }
        self.tombstone.min_stable_passes = self.tombstone.min_stable_passes.max(1);
        self.sync = self.sync.clamped();
        self.fetch = self.fetch.clamped();
        Ok(self)
    }
}

fn override_from<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(e) => warn!(key, value = %raw, error = %e, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = NodeConfig::default();
        assert_eq!(c.quota.private_bytes, 20 * 1024 * 1024);
        assert_eq!(c.quota.public_bytes, 80 * 1024 * 1024);
        assert_eq!(c.sync.interval_secs, 12);
        assert_eq!(c.fetch.timeout_ms, 4_000);
        assert_eq!(c.tombstone.min_stable_passes, 2);
        assert_eq!(c.server.bind_addr.port(), 7420);
    }

    #[test]
    fn toml_roundtrip_and_partial_files() {
        let c = NodeConfig::default();
        let text = c.to_toml_string().unwrap();
        assert_eq!(NodeConfig::from_toml_str(&text).unwrap(), c);

        let partial = NodeConfig::from_toml_str(
            r#"
            node_id = "alpha"

            [sync]
            index_budget = 50
            "#,
        )
        .unwrap();
        assert_eq!(partial.node_id, "alpha");
        assert_eq!(partial.sync.index_budget, 50);
        assert_eq!(partial.sync.body_budget, 16);
        assert!(partial.data_dir.is_none());
    }

    #[test]
    fn env_overrides_apply_and_bad_values_are_ignored() {
        let mut c = NodeConfig::default();
        c.apply_env_with(env(&[
            ("AGORA_NODE_ID", " beta "),
            ("AGORA_SYNC_BATCH_SIZE", "300"),
            ("AGORA_SYNC_INDEX_BUDGET", "lots"),
            ("AGORA_FETCH_RETRY_ATTEMPTS", "2"),
            ("AGORA_PUBLIC_QUOTA_BYTES", "1024"),
            ("AGORA_BIND_ADDR", "0.0.0.0:9000"),
            ("AGORA_REQUEST_LIMIT", "20"),
            ("AGORA_RATE_WINDOW_SECS", "-5"),
        ]));
        assert_eq!(c.sync.request_limit, 20);
        assert_eq!(c.sync.rate_window_secs, 60);
        assert_eq!(c.node_id, "beta");
        assert_eq!(c.sync.batch_size, 300);
        assert_eq!(c.sync.index_budget, 240);
        assert_eq!(c.fetch.retry_attempts, 2);
        assert_eq!(c.quota.public_bytes, 1024);
        assert_eq!(c.server.bind_addr.port(), 9000);
    }

    #[test]
    fn validate_clamps_budgets() {
        let mut c = NodeConfig::default();
        c.sync.batch_size = 9_999;
        c.sync.index_budget = 9_999;
        c.sync.body_budget = 9_999;
        c.fetch.retry_attempts = 10;
        c.tombstone.min_stable_passes = 0;
        let c = c.validate().unwrap();
        assert_eq!(c.sync.batch_size, 500);
        assert_eq!(c.sync.index_budget, 1000);
        assert_eq!(c.sync.body_budget, 200);
        assert_eq!(c.fetch.retry_attempts, 3);
        assert_eq!(c.tombstone.min_stable_passes, 1);
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let mut c = NodeConfig::default();
        c.quota.private_bytes = 0;
        assert!(matches!(c.validate(), Err(NodeError::Config(_))));

        let c = NodeConfig { node_id: "  ".into(), ..Default::default() };
        assert!(matches!(c.validate(), Err(NodeError::Config(_))));
    }
}
