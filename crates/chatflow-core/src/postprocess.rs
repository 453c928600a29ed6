//! Post-processing of a completed assistant response.
//!
//! Audits the finish reason, classifies returned tool calls against the
//! allow/deny policy, and re-applies the substitution rules to the final
//! content so streamed and non-streamed output agree.

use std::sync::Arc;

use chatflow_types::llm::CompletedResponse;
use chatflow_types::message::{Content, Message};
use chatflow_types::tool::{ToolCallRecord, ToolPolicy};

use crate::rewrite::Rewriter;

/// Content used when substitution erased a non-empty response.
pub const EMPTY_CONTENT_PLACEHOLDER: &str = "[content removed]";

/// Finish reasons that need no warning. Compared case-insensitively.
pub const KNOWN_FINISH_REASONS: &[&str] = &[
    "tool_calls",
    "stop",
    "length",
    "paused",
    "function_call",
    "null",
    "none",
    "",
];

/// Result of [`PostProcessor::handle_results`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessed {
    /// The assistant message with rewritten content.
    pub message: Message,
    /// Every returned tool call, in call order.
    pub records: Vec<ToolCallRecord>,
    /// Non-fatal anomalies worth surfacing.
    pub warnings: Vec<String>,
}

impl PostProcessed {
    pub fn has_tool_calls(&self) -> bool {
        !self.records.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PostProcessor {
    rewriter: Arc<Rewriter>,
}

impl PostProcessor {
    pub fn new(rewriter: Arc<Rewriter>) -> Self {
        Self { rewriter }
    }

    pub fn handle_results(&self, response: CompletedResponse, policy: &ToolPolicy) -> PostProcessed {
        let CompletedResponse {
            mut message,
            finish_reason,
        } = response;
        let mut warnings = Vec::new();

        let reason = finish_reason.as_deref().map(str::to_lowercase);
        if let Some(reason) = reason.as_deref() {
            if !KNOWN_FINISH_REASONS.contains(&reason) {
                tracing::warn!(finish_reason = %reason, "Unexpected finish reason");
                warnings.push(format!("unexpected finish reason: {reason}"));
            }
        }

        let no_content = message.text().trim().is_empty();
        let no_reasoning = message.reasoning().is_none_or(|r| r.trim().is_empty());
        let no_arguments = message
            .tool_calls()
            .iter()
            .all(|call| call.function.arguments.trim().is_empty());
        if reason.as_deref() != Some("content_filter") && no_content && no_reasoning && no_arguments
        {
            tracing::warn!("Empty response from provider");
            warnings.push("empty response".to_string());
        }

        let records = message
            .tool_calls()
            .iter()
            .enumerate()
            .map(|(index, call)| ToolCallRecord {
                tool_call: call.clone(),
                status: policy.decide(call.name()),
                index,
            })
            .collect();

        message.content = self.rewrite_content(message.content);

        PostProcessed {
            message,
            records,
            warnings,
        }
    }

    fn rewrite_content(&self, content: Content) -> Content {
        if self.rewriter.is_empty() {
            return content;
        }
        let had_text = !content.text().trim().is_empty();
        let rewritten = match content {
            Content::Text(text) => Content::Text(self.rewriter.apply(&text)),
            Content::Parts(mut parts) => {
                for part in parts.iter_mut().filter(|p| !p.is_media()) {
                    if let Some(text) = part.text.as_mut() {
                        *text = self.rewriter.apply(text);
                    }
                }
                Content::Parts(parts)
            }
        };
        if had_text && rewritten.text().trim().is_empty() {
            return Content::Text(EMPTY_CONTENT_PLACEHOLDER.to_string());
        }
        rewritten
    }
}
