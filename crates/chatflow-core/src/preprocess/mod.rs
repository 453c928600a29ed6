//! Preprocessor: rebuilds an outbound payload from raw history.
//!
//! `prepare` runs a fixed sequence of steps over an owned copy of the
//! history: windowing, caller hooks, tool-chain repair, style and
//! anti-repetition hints, search injection, long-context summary placement,
//! names and templates, multimodal normalization, bookkeeping purge, and
//! parameter assembly with the provider patch. The session history itself
//! is never touched.

pub mod hooks;
pub mod repetition;
pub mod search;
pub mod template;
pub mod window;

use std::sync::Arc;

use chatflow_types::config::{FlowConfig, LciPosition, PromptConfig, SearchSettings};
use chatflow_types::error::PipelineError;
use chatflow_types::llm::{ProviderConfig, SamplingParams};
use chatflow_types::message::{Content, ContentPart, Message, MessageKind, Role};
use chatflow_types::tool::ToolSpec;
use serde_json::{Map, Value};

use crate::llm::patch::{NoPatch, PatchContext, ProviderPatch};

use self::hooks::MessageHook;
use self::repetition::RepetitionReport;
use self::search::SearchFacade;
use self::template::{TemplateContext, TemplateEnvironment};

/// Messages cut before the trailing user turn on strong repetition.
const STRONG_TRUNCATION_CUT: usize = 4;

/// Per-send options that are not part of the persisted configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransientOptions {
    /// One-off style instruction for the next reply.
    pub temp_style: Option<String>,
    /// Result of a search already run for this turn.
    pub search_result: Option<String>,
    /// Overrides the configured streaming flag.
    pub stream: Option<bool>,
}

/// Everything needed to build one request. Consumed once.
///
/// The flow engine fills `history` from its session store when sending.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequestPack {
    pub history: Vec<Message>,
    pub model: String,
    pub provider: ProviderConfig,
    pub tools: Vec<ToolSpec>,
    pub options: TransientOptions,
}

impl CompletionRequestPack {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            history: Vec::new(),
            model: model.into(),
            provider: ProviderConfig::default(),
            tools: Vec::new(),
            options: TransientOptions::default(),
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_options(mut self, options: TransientOptions) -> Self {
        self.options = options;
        self
    }

    /// Names of the tools offered with this request.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }
}

/// Output of [`Preprocessor::prepare`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    /// Final messages, bookkeeping still attached.
    pub messages: Vec<Message>,
    /// Provider-ready request body.
    pub payload: Value,
}

/// Settings the preprocessor reads from [`FlowConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    pub window_budget: usize,
    pub stream: bool,
    pub sampling: SamplingParams,
    pub prompt: PromptConfig,
    pub search: SearchSettings,
}

impl From<&FlowConfig> for PreprocessConfig {
    fn from(config: &FlowConfig) -> Self {
        Self {
            window_budget: config.window_budget,
            stream: config.stream,
            sampling: config.sampling.clone(),
            prompt: config.prompt.clone(),
            search: config.search.clone(),
        }
    }
}

pub struct Preprocessor {
    config: PreprocessConfig,
    hooks: Vec<Arc<dyn MessageHook>>,
    search: Option<Arc<dyn SearchFacade>>,
    patch: Arc<dyn ProviderPatch>,
    environment: TemplateEnvironment,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            config,
            hooks: Vec::new(),
            search: None,
            patch: Arc::new(NoPatch),
            environment: TemplateEnvironment::detect(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn MessageHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchFacade>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_patch(mut self, patch: Arc<dyn ProviderPatch>) -> Self {
        self.patch = patch;
        self
    }

    pub fn with_environment(mut self, environment: TemplateEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Build the outbound messages and payload for `pack`.
    pub async fn prepare(&self, pack: &CompletionRequestPack) -> Result<PreparedRequest, PipelineError> {
        if pack.history.is_empty() {
            return Err(PipelineError::EmptyHistory);
        }

        let mut messages = window::window(&pack.history, self.config.window_budget);

        for hook in &self.hooks {
            hook.apply(&mut messages, pack)?;
            tracing::trace!(hook = hook.name(), "Message hook applied");
        }

        window::repair(&mut messages, &pack.history);

        self.inject_hints(&mut messages, pack);

        if let Some(results) = self.search_results(pack, &messages).await {
            insert_before_last_user(&mut messages, Message::system(search::format_results(&results)));
        }

        if self.config.prompt.lci_position == LciPosition::First {
            merge_lci(&mut messages);
        }

        self.apply_names_and_templates(&mut messages, pack);
        normalize_multimodal(&mut messages);

        let payload = self.assemble(&messages, pack)?;
        tracing::debug!(
            model = %pack.model,
            provider = %pack.provider.provider_type,
            messages = messages.len(),
            tools = pack.tools.len(),
            "Request prepared"
        );

        Ok(PreparedRequest { messages, payload })
    }

    /// Style and anti-repetition hints, merged into one system message.
    fn inject_hints(&self, messages: &mut Vec<Message>, pack: &CompletionRequestPack) {
        let mut parts = Vec::new();

        if self.config.prompt.anti_repetition {
            let turns: Vec<String> = messages
                .iter()
                .filter(|m| m.role() == Role::Assistant)
                .map(Message::text)
                .filter(|t| !t.trim().is_empty())
                .collect();
            let report = repetition::analyze(&turns);
            if report.strong_truncation {
                let cut = truncate_tail(messages);
                tracing::debug!(cut, "Strong repetition, truncated history tail");
            }
            if let Some(hint) = repetition::hint(&report) {
                parts.push(hint);
            }
            log_report(&report);
        }

        if let Some(style) = pack.options.temp_style.as_deref().filter(|s| !s.trim().is_empty()) {
            parts.push(style.trim().to_string());
        }

        if !parts.is_empty() {
            insert_before_last_user(messages, Message::system(parts.join("\n\n")));
        }
    }

    async fn search_results(&self, pack: &CompletionRequestPack, messages: &[Message]) -> Option<String> {
        if let Some(result) = pack.options.search_result.as_deref() {
            return (!result.trim().is_empty()).then(|| result.to_string());
        }
        if !self.config.search.on_demand {
            return None;
        }
        let search = self.search.as_ref()?;
        let query = messages
            .iter()
            .rev()
            .find(|m| m.role() == Role::User)
            .map(Message::text)
            .filter(|q| !q.trim().is_empty())?;

        match search.run(&query, &self.config.search).await {
            Ok(results) if !results.trim().is_empty() => Some(results),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Web search failed, continuing without results");
                None
            }
        }
    }

    fn apply_names_and_templates(&self, messages: &mut [Message], pack: &CompletionRequestPack) {
        let prompt = &self.config.prompt;
        let user_name = template::sanitize_name(&prompt.user_name);
        let char_name = template::sanitize_name(&prompt.char_name);
        let ctx = TemplateContext::new(&prompt.user_name, &prompt.char_name, &pack.model, &self.environment);

        for message in messages.iter_mut() {
            match &mut message.kind {
                MessageKind::User { name } if prompt.enforce_names => name.clone_from(&user_name),
                MessageKind::Assistant { name, .. } if prompt.enforce_names => {
                    name.clone_from(&char_name)
                }
                MessageKind::System => expand_content(&mut message.content, &ctx),
                _ => {}
            }
        }
    }

    fn assemble(&self, messages: &[Message], pack: &CompletionRequestPack) -> Result<Value, PipelineError> {
        let stream = pack.options.stream.unwrap_or(self.config.stream);

        let wire_messages = messages
            .iter()
            .map(purge_info)
            .collect::<Result<Vec<_>, _>>()?;

        let mut params = Map::new();
        params.insert("model".to_string(), Value::String(pack.model.clone()));
        params.insert("messages".to_string(), Value::Array(wire_messages));
        params.insert("stream".to_string(), Value::Bool(stream));

        match serde_json::to_value(&self.config.sampling) {
            Ok(Value::Object(sampling)) => params.extend(sampling),
            Ok(_) => {}
            Err(e) => return Err(PipelineError::Serialization(e.to_string())),
        }

        if !pack.tools.is_empty() {
            let tools = pack.tools.iter().map(ToolSpec::to_wire).collect();
            params.insert("tools".to_string(), Value::Array(tools));
            params.insert("tool_choice".to_string(), Value::String("auto".to_string()));
        }

        let context = PatchContext {
            model: pack.model.clone(),
            stream,
            has_tools: !pack.tools.is_empty(),
            base_url: pack.provider.base_url.clone(),
        };
        let params = self.patch.patch(params, pack.provider.provider_type, &context);
        Ok(Value::Object(params))
    }
}

fn log_report(report: &RepetitionReport) {
    if !report.is_clean() {
        tracing::debug!(
            strong = report.strong_truncation,
            phrases = report.phrases.len(),
            "Repetition detected"
        );
    }
}

/// Insert `message` right before the last user message, or append it.
fn insert_before_last_user(messages: &mut Vec<Message>, message: Message) {
    match messages.iter().rposition(|m| m.role() == Role::User) {
        Some(index) if index > 0 => messages.insert(index, message),
        _ => messages.push(message),
    }
}

/// Drop up to [`STRONG_TRUNCATION_CUT`] messages before the trailing user
/// turn, widening the cut so no tool result loses its assistant call.
fn truncate_tail(messages: &mut Vec<Message>) -> usize {
    let Some(user) = messages.iter().rposition(|m| m.role() == Role::User) else {
        return 0;
    };
    if user <= 1 {
        return 0;
    }
    let mut start = user.saturating_sub(STRONG_TRUNCATION_CUT).max(1);
    while start > 1 && messages[start].role() == Role::Tool {
        start -= 1;
    }
    messages.drain(start..user);
    user - start
}

/// Fold a leading long-context summary into the message after it.
fn merge_lci(messages: &mut Vec<Message>) {
    let is_lci = messages
        .get(1)
        .is_some_and(|m| m.role() == Role::System && m.info.lci);
    if !is_lci || messages.len() < 3 {
        return;
    }
    let summary = messages.remove(1).text();
    messages[1].content.prepend_text(&summary);
}

fn expand_content(content: &mut Content, ctx: &TemplateContext<'_>) {
    match content {
        Content::Text(text) => *text = template::expand(text, ctx),
        Content::Parts(parts) => {
            for text in parts.iter_mut().filter_map(|p| p.text.as_mut()) {
                *text = template::expand(text, ctx);
            }
        }
    }
}

/// Rewrite content as `[text, ...media]` for messages carrying attachments.
fn normalize_multimodal(messages: &mut [Message]) {
    for message in messages.iter_mut() {
        let Some(media) = message.info.multimodal.take().filter(|m| !m.is_empty()) else {
            continue;
        };
        let mut parts = Vec::with_capacity(media.len() + 1);
        parts.push(ContentPart::text(message.content.text()));
        parts.extend(media);
        message.content = Content::Parts(parts);
    }
}

/// Serialize a message without its bookkeeping block.
fn purge_info(message: &Message) -> Result<Value, PipelineError> {
    let mut value =
        serde_json::to_value(message).map_err(|e| PipelineError::Serialization(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.remove("info");
    }
    Ok(value)
}
