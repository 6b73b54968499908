//! Engine configuration loader.
//!
//! Reads `waystation.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. A missing or malformed file falls back to defaults.
//! Environment variables override individual fields afterwards.

use std::path::Path;

use secrecy::SecretString;
use waystation_types::config::EngineConfig;

use crate::sqlite::pool::database_url_in;

pub const CONFIG_FILE: &str = "waystation.toml";

pub const ENV_BASE_URL: &str = "WAYSTATION_BASE_URL";
pub const ENV_SIGNING_KEY: &str = "WAYSTATION_SIGNING_KEY";
pub const ENV_DATABASE_URL: &str = "WAYSTATION_DATABASE_URL";

/// Load `{data_dir}/waystation.toml`, then apply environment overrides.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let mut config = read_config_file(data_dir).await;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config
}

async fn read_config_file(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Apply `WAYSTATION_*` overrides. Empty values are ignored.
pub fn apply_env_overrides(config: &mut EngineConfig, lookup: impl Fn(&str) -> Option<String>) {
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(base_url) = get(ENV_BASE_URL) {
        config.base_url = base_url;
    }
    if let Some(key) = get(ENV_SIGNING_KEY) {
        config.signing_key = Some(key);
    }
    if let Some(url) = get(ENV_DATABASE_URL) {
        config.database_url = Some(url);
    }
}

/// Configured database URL, else the ledger file inside `data_dir`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_in(data_dir))
}

/// The signing key wrapped for handling; `None` disables verification.
pub fn signing_key(config: &EngineConfig) -> Option<SecretString> {
    config
        .signing_key
        .as_ref()
        .filter(|k| !k.is_empty())
        .map(|k| SecretString::from(k.clone()))
}
