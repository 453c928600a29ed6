//! Configuration loader for chatflow.
//!
//! Reads `config.toml` from the data directory (`~/.chatflow/` in production)
//! and deserializes it into [`FlowConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use chatflow_types::config::FlowConfig;
use chatflow_types::error::ConfigError;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CHATFLOW_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `CHATFLOW_DATA_DIR` environment variable
/// 2. `~/.chatflow`
/// 3. `.chatflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".chatflow");
    }
    PathBuf::from(".chatflow")
}

/// Read and parse a config file, reporting any failure.
pub async fn read_flow_config(path: &Path) -> Result<FlowConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    toml::from_str(&content).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns [`FlowConfig::default()`].
/// - Unreadable or malformed file: logs a warning and returns the default.
pub async fn load_flow_config(data_dir: &Path) -> FlowConfig {
    let path = data_dir.join(CONFIG_FILE);
    match read_flow_config(&path).await {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            FlowConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            FlowConfig::default()
        }
    }
}
