//! Engine configuration types.
//!
//! `EngineConfig` represents `waystation.toml`. Every field has a default so
//! an empty or partial file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Waystation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Public base URL continuations are delivered to.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Workflow-level retries for failing step closures.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// HMAC key for trigger signatures. `None` disables verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,

    /// How long an invocation holds the run lease.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    /// Base delay of the workflow-level retry backoff.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// SQLite URL. `None` resolves to `{data_dir}/waystation.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub call: CallConfig,

    #[serde(default)]
    pub sweeper: SweeperConfig,
}

fn default_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_retries() -> u32 {
    3
}

fn default_lease_ttl_secs() -> u64 {
    60
}

fn default_retry_backoff_ms() -> u64 {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            retries: default_retries(),
            signing_key: None,
            lease_ttl_secs: default_lease_ttl_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            database_url: None,
            call: CallConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

/// Outbound call scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Timeout applied to each attempt.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Attempts in flight across all runs.
    #[serde(default = "default_max_concurrent_attempts")]
    pub max_concurrent_attempts: usize,

    /// Backoffs up to this length are slept inline; longer ones suspend.
    #[serde(default = "default_max_inline_backoff_ms")]
    pub max_inline_backoff_ms: u64,

    /// Delay after the first failed attempt; doubles per attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_attempts() -> usize {
    32
}

fn default_max_inline_backoff_ms() -> u64 {
    1_000
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_concurrent_attempts: default_max_concurrent_attempts(),
            max_inline_backoff_ms: default_max_inline_backoff_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Timer sweeper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,

    /// A due timer is only redelivered by the sweeper once it is this late,
    /// leaving room for the in-process delayed delivery.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// The broker only waits in-process for continuations due within this
    /// window; later ones stay in the `timers` table for the sweeper.
    #[serde(default = "default_horizon_secs")]
    pub horizon_secs: u64,
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_grace_secs() -> u64 {
    10
}

fn default_horizon_secs() -> u64 {
    60
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            grace_secs: default_grace_secs(),
            horizon_secs: default_horizon_secs(),
        }
    }
}
