//! Application state shared by CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use chatflow_infra::config::{load_flow_config, resolve_data_dir};
use chatflow_infra::persistence::JsonSessionStore;
use chatflow_types::config::FlowConfig;

/// Data directory, effective configuration, and session store.
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: FlowConfig,
    pub store: Arc<JsonSessionStore>,
}

impl AppState {
    /// Resolve the data directory and load its configuration.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        let config = load_flow_config(&data_dir).await;
        let store = Arc::new(JsonSessionStore::in_data_dir(&data_dir));
        tracing::debug!(data_dir = %data_dir.display(), "Application state ready");
        Ok(Self {
            data_dir,
            config,
            store,
        })
    }
}
