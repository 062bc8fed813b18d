//! EngineConfig - エンジンの調整パラメータ
//!
//! `Default` が本番向けの値です。`from_env()` で `PODLOOM_*` 環境変数を上書きできます。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::retry::RetryPolicy;

/// Log text returned when a running container's log cannot be fetched.
pub const LIVE_LOG_PLACEHOLDER: &str = "Failed to get logs from running container.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backoff for every orchestrator call.
    pub retry: RetryPolicy,
    /// Consecutive failed probes before an instance is marked FAILED.
    pub max_probe_failures: u32,
    /// Bound on a single `list` probe.
    pub probe_timeout: Duration,
    /// How long cancellation waits for the orchestrator to confirm teardown.
    pub teardown_grace: Duration,
    /// Poll interval while waiting for teardown confirmation.
    pub confirm_poll: Duration,
    /// Delete exited containers once their log is persisted.
    pub remove_finished_containers: bool,
    /// Selector label key; containers are tagged `<label_key>=<instance id>`.
    pub label_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_probe_failures: 3,
            probe_timeout: Duration::from_secs(5),
            teardown_grace: Duration::from_secs(30),
            confirm_poll: Duration::from_millis(500),
            remove_finished_containers: true,
            label_key: "app".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

impl EngineConfig {
    /// Defaults overlaid with `PODLOOM_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, "PODLOOM_RETRY_BASE_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<u32>(&lookup, "PODLOOM_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "PODLOOM_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse::<u32>(&lookup, "PODLOOM_MAX_PROBE_FAILURES")? {
            config.max_probe_failures = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "PODLOOM_PROBE_TIMEOUT_MS")? {
            config.probe_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse::<u64>(&lookup, "PODLOOM_TEARDOWN_GRACE_SECS")? {
            config.teardown_grace = Duration::from_secs(secs);
        }
        if let Some(flag) = parse::<bool>(&lookup, "PODLOOM_REMOVE_FINISHED")? {
            config.remove_finished_containers = flag;
        }
        if let Some(key) = lookup("PODLOOM_LABEL_KEY") {
            if key.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: "PODLOOM_LABEL_KEY",
                    value: key,
                });
            }
            config.label_key = key;
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
