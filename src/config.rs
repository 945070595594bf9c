//! Tunables for the sync engine and the metadata aggregator.
//!
//! Durations are written in milliseconds so the TOML stays flat:
//!
//! ```toml
//! [sync]
//! fetch_timeout_ms = 10000
//! max_retries = 2
//! retry_delay_ms = 1000
//!
//! [metadata]
//! buffer_window_ms = 1000
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Retry and timeout policy for the release sync engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Bound on a single snapshot fetch.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Retries after the first attempt before a failure becomes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Bounded buffer for cache subscribers.
    #[serde(default = "default_buffer_size")]
    pub subscriber_buffer: usize,
}

impl SyncConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Total fetch attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            subscriber_buffer: default_buffer_size(),
        }
    }
}

/// Batching policy for the metadata aggregator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Window over which mutation events are coalesced.
    #[serde(default = "default_buffer_window_ms")]
    pub buffer_window_ms: u64,

    /// Bound on an aggregate fetch.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Bounded buffer for metadata subscribers.
    #[serde(default = "default_buffer_size")]
    pub subscriber_buffer: usize,
}

impl AggregatorConfig {
    pub fn buffer_window(&self) -> Duration {
        Duration::from_millis(self.buffer_window_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            buffer_window_ms: default_buffer_window_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            subscriber_buffer: default_buffer_size(),
        }
    }
}

/// Top-level configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasesConfig {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub metadata: AggregatorConfig,
}

/// Load configuration from a TOML file. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<ReleasesConfig> {
    if !path.exists() {
        return Ok(ReleasesConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let config: ReleasesConfig = toml::from_str(&raw)?;
    Ok(config)
}

const fn default_fetch_timeout_ms() -> u64 {
    10_000
}

const fn default_max_retries() -> u32 {
    2
}

const fn default_retry_delay_ms() -> u64 {
    1_000
}

const fn default_buffer_window_ms() -> u64 {
    1_000
}

const fn default_buffer_size() -> usize {
    256
}
