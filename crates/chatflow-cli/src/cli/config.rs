//! Effective configuration display.

use anyhow::Result;
use console::style;

use chatflow_infra::config::CONFIG_FILE;

use crate::state::AppState;

/// Print the configuration in effect, defaults included.
pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&state.config)?);
        return Ok(());
    }

    let path = state.data_dir.join(CONFIG_FILE);
    let source = if path.exists() {
        style(path.display().to_string()).yellow()
    } else {
        style("built-in defaults".to_string()).dim()
    };

    println!();
    println!("  {} {}", style("Config").cyan().bold(), source);
    println!();
    println!("{}", toml::to_string_pretty(&state.config)?);
    Ok(())
}
