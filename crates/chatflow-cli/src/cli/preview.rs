//! Request preview: run the preprocessor over a saved session offline.

use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use serde_json::Value;

use chatflow_core::chat::repository::SessionPersistence;
use chatflow_core::preprocess::{CompletionRequestPack, PreprocessConfig, Preprocessor, TransientOptions};
use chatflow_infra::provider_patch::DefaultProviderPatch;
use chatflow_types::config::FlowConfig;
use chatflow_types::llm::{ProviderConfig, ProviderType};
use chatflow_types::session::SessionSnapshot;
use chatflow_types::tool::ToolSpec;

use crate::state::AppState;

/// What to put into the previewed request besides the saved history.
#[derive(Debug, Clone, Default)]
pub struct PreviewOptions {
    pub model: String,
    pub provider: ProviderType,
    pub tools: Vec<String>,
    pub style: Option<String>,
}

/// Build the payload that would be sent for `snapshot`.
pub async fn build_preview(
    config: &FlowConfig,
    snapshot: SessionSnapshot,
    options: PreviewOptions,
) -> Result<Value> {
    let preprocessor = Preprocessor::new(PreprocessConfig::from(config))
        .with_patch(Arc::new(DefaultProviderPatch));

    let provider = ProviderConfig {
        name: options.provider.to_string(),
        provider_type: options.provider,
        base_url: None,
    };
    let tools = options
        .tools
        .iter()
        .map(|name| ToolSpec::new(name.as_str(), ""))
        .collect();
    let pack = CompletionRequestPack::new(options.model)
        .with_history(snapshot.messages)
        .with_provider(provider)
        .with_tools(tools)
        .with_options(TransientOptions {
            temp_style: options.style,
            ..TransientOptions::default()
        });

    let prepared = preprocessor
        .prepare(&pack)
        .await
        .context("Preprocessing failed")?;
    Ok(prepared.payload)
}

/// Print the payload for a saved session.
///
/// # Examples
///
/// ```bash
/// chatflow preview 0192f7c4 --provider anthropic --model claude-sonnet
/// ```
pub async fn preview(state: &AppState, chat_id: &str, options: PreviewOptions, json: bool) -> Result<()> {
    let snapshot = state
        .store
        .load(chat_id)
        .await
        .with_context(|| format!("Session '{chat_id}' could not be loaded"))?;
    let provider = options.provider;
    let message_count = snapshot.messages.len();

    let payload = build_preview(&state.config, snapshot, options).await?;
    let rendered = serde_json::to_string_pretty(&payload)?;

    if json {
        println!("{rendered}");
        return Ok(());
    }

    let sent = payload
        .get("messages")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    println!();
    println!(
        "  {} {} of {} messages for {}",
        style("Preview").cyan().bold(),
        style(sent).bold(),
        message_count,
        style(provider).yellow()
    );
    println!();
    println!("{rendered}");
    println!();
    Ok(())
}
