//! Default provider compatibility patch.
//!
//! Applied as the last step of payload assembly. Each provider family gets
//! the handful of renames its API needs; unknown providers pass through.

use serde_json::{Map, Value, json};

use chatflow_core::llm::patch::{PatchContext, ProviderPatch};
use chatflow_types::llm::ProviderType;

/// Model prefixes of OpenAI reasoning models.
const OPENAI_REASONING_PREFIXES: &[&str] = &["o1", "o3", "o4", "gpt-5"];

/// Sampling knobs reasoning models reject.
const REASONING_UNSUPPORTED: &[&str] = &["temperature", "top_p", "presence_penalty", "frequency_penalty"];

/// Parameters Ollama expects under `options`.
const OLLAMA_OPTIONS: &[(&str, &str)] = &[
    ("temperature", "temperature"),
    ("top_p", "top_p"),
    ("seed", "seed"),
    ("stop", "stop"),
    ("presence_penalty", "presence_penalty"),
    ("frequency_penalty", "frequency_penalty"),
    ("max_tokens", "num_predict"),
];

/// `max_tokens` sent to Anthropic when none is configured; the field is required.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;

/// Built-in quirks for the supported provider families.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProviderPatch;

impl ProviderPatch for DefaultProviderPatch {
    fn patch(
        &self,
        mut params: Map<String, Value>,
        provider: ProviderType,
        context: &PatchContext,
    ) -> Map<String, Value> {
        match provider {
            ProviderType::OpenAi => {
                if is_reasoning_model(&context.model) {
                    if let Some(max) = params.remove("max_tokens") {
                        params.insert("max_completion_tokens".to_string(), max);
                    }
                    for key in REASONING_UNSUPPORTED {
                        params.remove(*key);
                    }
                }
                if context.stream {
                    params.insert("stream_options".to_string(), json!({ "include_usage": true }));
                }
            }
            ProviderType::Ollama => {
                let mut options = match params.remove("options") {
                    Some(Value::Object(existing)) => existing,
                    _ => Map::new(),
                };
                for (from, to) in OLLAMA_OPTIONS {
                    if let Some(value) = params.remove(*from) {
                        options.insert((*to).to_string(), value);
                    }
                }
                if !options.is_empty() {
                    params.insert("options".to_string(), Value::Object(options));
                }
            }
            ProviderType::Anthropic => lift_system_messages(&mut params),
            ProviderType::OpenAiCompatible | ProviderType::DeepSeek => {}
        }
        tracing::trace!(provider = %provider, model = %context.model, "Provider patch applied");
        params
    }
}

fn is_reasoning_model(model: &str) -> bool {
    let model = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    OPENAI_REASONING_PREFIXES
        .iter()
        .any(|prefix| model.starts_with(prefix))
}

/// Move system messages into the top-level `system` field.
fn lift_system_messages(params: &mut Map<String, Value>) {
    if let Some(Value::Array(messages)) = params.get_mut("messages") {
        let mut system = Vec::new();
        messages.retain(|message| {
            if message.get("role").and_then(Value::as_str) != Some("system") {
                return true;
            }
            let text = content_text(message.get("content"));
            if !text.is_empty() {
                system.push(text);
            }
            false
        });
        if !system.is_empty() {
            params.insert("system".to_string(), Value::String(system.join("\n\n")));
        }
    }

    if let Some(stop) = params.remove("stop") {
        params.insert("stop_sequences".to_string(), stop);
    }
    if !params.contains_key("max_tokens") {
        params.insert("max_tokens".to_string(), json!(ANTHROPIC_DEFAULT_MAX_TOKENS));
    }
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
