//! Configuration types for chatflow.
//!
//! `FlowConfig` is the top-level `config.toml`. Every field has a default so
//! an empty file (or no file) yields a working configuration.

use serde::{Deserialize, Serialize};

use crate::llm::SamplingParams;
use crate::tool::ToolPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Number of non-tool messages kept after the system message.
    #[serde(default = "default_window_budget")]
    pub window_budget: usize,

    /// Minimum time between two session writes, in milliseconds.
    #[serde(default = "default_autosave_cooldown_ms")]
    pub autosave_cooldown_ms: u64,

    #[serde(default = "default_stream")]
    pub stream: bool,

    #[serde(default)]
    pub sampling: SamplingParams,

    #[serde(default)]
    pub tool_policy: ToolPolicy,

    #[serde(default)]
    pub rewrite: RewriteConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub search: SearchSettings,
}

fn default_window_budget() -> usize {
    20
}

fn default_autosave_cooldown_ms() -> u64 {
    2000
}

fn default_stream() -> bool {
    true
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            window_budget: default_window_budget(),
            autosave_cooldown_ms: default_autosave_cooldown_ms(),
            stream: default_stream(),
            sampling: SamplingParams::default(),
            tool_policy: ToolPolicy::default(),
            rewrite: RewriteConfig::default(),
            prompt: PromptConfig::default(),
            search: SearchSettings::default(),
        }
    }
}

/// One text substitution applied to assistant output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    /// Treat `pattern` as a regular expression instead of a literal.
    #[serde(default)]
    pub regex: bool,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl RewriteRule {
    pub fn literal(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
            regex: false,
            case_insensitive: false,
        }
    }

    pub fn regex(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            regex: true,
            ..Self::literal(pattern, replacement)
        }
    }
}

/// Substitution rules and streaming hold-back for regex rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteConfig {
    #[serde(default)]
    pub rules: Vec<RewriteRule>,
    /// Longest text (in chars) a regex rule is expected to match.
    #[serde(default = "default_regex_span")]
    pub regex_max_span: usize,
}

fn default_regex_span() -> usize {
    64
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            regex_max_span: default_regex_span(),
        }
    }
}

/// Where an injected long-context summary is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LciPosition {
    /// Leave the summary as its own system message.
    #[default]
    Standalone,
    /// Merge the summary into the first conversation message.
    First,
}

/// Prompt shaping options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default = "default_char_name")]
    pub char_name: String,
    /// Send `name` on user and assistant messages.
    #[serde(default)]
    pub enforce_names: bool,
    /// Detect repetitive assistant turns and steer away from them.
    #[serde(default)]
    pub anti_repetition: bool,
    #[serde(default)]
    pub lci_position: LciPosition,
}

fn default_user_name() -> String {
    "user".to_string()
}

fn default_char_name() -> String {
    "assistant".to_string()
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            user_name: default_user_name(),
            char_name: default_char_name(),
            enforce_names: false,
            anti_repetition: false,
            lci_position: LciPosition::default(),
        }
    }
}

/// Web search options passed to the search facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Search with the trailing user message when no result is cached.
    #[serde(default)]
    pub on_demand: bool,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
    #[serde(default)]
    pub use_rag: bool,
    #[serde(default = "default_rag_chunk_size")]
    pub rag_chunk_size: usize,
    #[serde(default = "default_rag_top_k")]
    pub rag_top_k: usize,
}

fn default_search_limit() -> usize {
    5
}

fn default_rag_chunk_size() -> usize {
    800
}

fn default_rag_top_k() -> usize {
    4
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            on_demand: false,
            limit: default_search_limit(),
            use_rag: false,
            rag_chunk_size: default_rag_chunk_size(),
            rag_top_k: default_rag_top_k(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::DefaultDecision;

    #[test]
    fn test_flow_config_default_values() {
        let config = FlowConfig::default();
        assert_eq!(config.window_budget, 20);
        assert_eq!(config.autosave_cooldown_ms, 2000);
        assert!(config.stream);
        assert!(config.rewrite.rules.is_empty());
        assert_eq!(config.prompt.lci_position, LciPosition::Standalone);
    }

    #[test]
    fn test_flow_config_deserialize_empty() {
        let config: FlowConfig = toml::from_str("").unwrap();
        assert_eq!(config, FlowConfig::default());
    }

    #[test]
    fn test_flow_config_deserialize_with_values() {
        let toml_str = r#"
window_budget = 8
autosave_cooldown_ms = 150

[sampling]
temperature = 0.4

[tool_policy]
deny = ["shell"]
default = "deny"

[[rewrite.rules]]
pattern = "As an AI"
replacement = "I"

[prompt]
anti_repetition = true
lci_position = "first"
"#;
        let config: FlowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.window_budget, 8);
        assert_eq!(config.autosave_cooldown_ms, 150);
        assert_eq!(config.sampling.temperature, Some(0.4));
        assert!(config.tool_policy.deny.contains("shell"));
        assert_eq!(config.tool_policy.default, DefaultDecision::Deny);
        assert_eq!(config.rewrite.rules.len(), 1);
        assert!(!config.rewrite.rules[0].regex);
        assert!(config.prompt.anti_repetition);
        assert_eq!(config.prompt.lci_position, LciPosition::First);
        assert_eq!(config.prompt.user_name, "user");
    }
}
