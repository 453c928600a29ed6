//! Tool call types: provider-format calls, tool specs attached to requests,
//! the allow/deny policy, and the per-call classification records.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A tool invocation emitted by the model, in provider (OpenAI) format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "default_call_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn default_call_type() -> String {
    "function".to_string()
}

/// Function name and JSON-encoded arguments of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: default_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// A tool made available to the model for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: empty_object_schema(),
        }
    }

    /// Wire form used in the `tools` request parameter.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Outcome of classifying a tool call against the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Allowed,
    Denied,
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolCallStatus::Allowed => write!(f, "allowed"),
            ToolCallStatus::Denied => write!(f, "denied"),
        }
    }
}

/// A returned tool call with its classification and position in the batch.
///
/// Transient: produced and consumed within one engine cycle, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub tool_call: ToolCall,
    pub status: ToolCallStatus,
    /// Position of the call in the assistant message's `tool_calls`.
    pub index: usize,
}

/// Decision for tool names that appear on neither list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultDecision {
    /// Unknown tools run without asking.
    #[default]
    Allow,
    /// Unknown tools require explicit permission.
    Deny,
}

/// Allow/deny policy for returned tool calls.
///
/// The deny list wins over the allow list. Names on neither list follow
/// `default`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub allow: BTreeSet<String>,
    #[serde(default)]
    pub deny: BTreeSet<String>,
    #[serde(default)]
    pub default: DefaultDecision,
}

impl ToolPolicy {
    pub fn decide(&self, tool_name: &str) -> ToolCallStatus {
        if self.deny.contains(tool_name) {
            return ToolCallStatus::Denied;
        }
        if self.allow.contains(tool_name) {
            return ToolCallStatus::Allowed;
        }
        match self.default {
            DefaultDecision::Allow => ToolCallStatus::Allowed,
            DefaultDecision::Deny => ToolCallStatus::Denied,
        }
    }

    /// Move a tool onto the allow list.
    pub fn grant(&mut self, tool_name: &str) {
        self.deny.remove(tool_name);
        self.allow.insert(tool_name.to_string());
    }

    /// Move a tool onto the deny list.
    pub fn revoke(&mut self, tool_name: &str) {
        self.allow.remove(tool_name);
        self.deny.insert(tool_name.to_string());
    }
}
