//! Provider-facing types: provider identity, sampling parameters, and the
//! events a transport streams back for one request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::message::Message;

/// Type of provider backend a request is sent to.
///
/// Only used to select compatibility patches; the transport itself is an
/// external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    OpenAi,
    #[default]
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
    Anthropic,
    Ollama,
    DeepSeek,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::OpenAi => write!(f, "open_ai"),
            ProviderType::OpenAiCompatible => write!(f, "openai_compatible"),
            ProviderType::Anthropic => write!(f, "anthropic"),
            ProviderType::Ollama => write!(f, "ollama"),
            ProviderType::DeepSeek => write!(f, "deep_seek"),
        }
    }
}

impl FromStr for ProviderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open_ai" | "openai" => Ok(ProviderType::OpenAi),
            "openai_compatible" => Ok(ProviderType::OpenAiCompatible),
            "anthropic" => Ok(ProviderType::Anthropic),
            "ollama" => Ok(ProviderType::Ollama),
            "deep_seek" | "deepseek" => Ok(ProviderType::DeepSeek),
            other => Err(format!("invalid provider type: '{other}'")),
        }
    }
}

/// Provider a request is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Human-readable name (e.g., "openai", "local-ollama").
    pub name: String,
    pub provider_type: ProviderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            provider_type: ProviderType::default(),
            base_url: None,
        }
    }
}

/// Optional sampling parameters. Only the ones set are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// A finished response as reported by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedResponse {
    /// The assistant message, content not yet rewritten.
    pub message: Message,
    /// Raw finish reason reported by the provider, if any.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Events a transport emits while serving one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A chunk of assistant content.
    ContentDelta { text: String },
    /// A chunk of reasoning content.
    ReasoningDelta { text: String },
    /// The response is complete.
    Completed(CompletedResponse),
}

/// Errors reported by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_roundtrip() {
        for pt in [
            ProviderType::OpenAi,
            ProviderType::OpenAiCompatible,
            ProviderType::Anthropic,
            ProviderType::Ollama,
            ProviderType::DeepSeek,
        ] {
            let parsed: ProviderType = pt.to_string().parse().unwrap();
            assert_eq!(pt, parsed);
        }
    }

    #[test]
    fn test_provider_type_serde() {
        let json = serde_json::to_string(&ProviderType::OpenAiCompatible).unwrap();
        assert_eq!(json, "\"openai_compatible\"");
        let parsed: ProviderType = serde_json::from_str("\"ollama\"").unwrap();
        assert_eq!(parsed, ProviderType::Ollama);
    }

    #[test]
    fn test_sampling_params_skip_unset() {
        let params = SamplingParams {
            temperature: Some(0.7),
            ..Default::default()
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 1);
        assert_eq!(value["temperature"], 0.7);
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::RateLimited {
            retry_after_ms: Some(1500),
        };
        assert!(err.to_string().contains("1500"));
    }
}
