//! Conversation message types for chatflow.
//!
//! A [`Message`] is one entry of a conversation history: a per-role payload
//! ([`MessageKind`]), its content, and a bookkeeping block ([`MessageInfo`])
//! that is stripped before a request leaves the process.
//!
//! The role tag is validated at the JSON boundary: a history either
//! deserializes into these types or fails, so the rest of the workspace
//! matches on [`MessageKind`] instead of probing dynamic maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::tool::ToolCall;

/// Length charged for a single non-text content part.
pub const MEDIA_PART_COST: usize = 1000;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("invalid message role: '{other}'")),
        }
    }
}

/// Role-specific fields of a message.
///
/// Each variant carries only the fields its role may legally send on the
/// wire. Serialized as the `role` tag plus those fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageKind {
    System,
    User {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        #[serde(
            default,
            deserialize_with = "null_as_default",
            skip_serializing_if = "Vec::is_empty"
        )]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl MessageKind {
    pub fn role(&self) -> Role {
        match self {
            MessageKind::System => Role::System,
            MessageKind::User { .. } => Role::User,
            MessageKind::Assistant { .. } => Role::Assistant,
            MessageKind::Tool { .. } => Role::Tool,
        }
    }
}

/// A single part of multimodal content.
///
/// `kind` is the wire `type` tag (`text`, `image_url`, `input_audio`, ...).
/// Everything except the text body is kept verbatim in `payload` so parts
/// this crate does not know about survive a load/save cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl ContentPart {
    /// A plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            payload: serde_json::Map::new(),
        }
    }

    /// An `image_url` part pointing at a URL or data URI.
    pub fn image_url(url: impl Into<String>) -> Self {
        let mut payload = serde_json::Map::new();
        payload.insert(
            "image_url".to_string(),
            serde_json::json!({ "url": url.into() }),
        );
        Self {
            kind: "image_url".to_string(),
            text: None,
            payload,
        }
    }

    /// Whether this part carries media rather than text.
    pub fn is_media(&self) -> bool {
        self.kind != "text"
    }

    /// Length contribution of this part.
    ///
    /// Media parts cost [`MEDIA_PART_COST`], text parts their character
    /// count. A text part without a text body is measured by its serialized
    /// form.
    pub fn measured_len(&self) -> usize {
        if self.is_media() {
            return MEDIA_PART_COST;
        }
        match &self.text {
            Some(text) => text.chars().count(),
            None => serde_json::to_string(self)
                .map(|s| s.chars().count())
                .unwrap_or_default(),
        }
    }
}

/// Message content: a plain string or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_string())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl Content {
    /// Concatenated text of the content, ignoring media parts.
    pub fn text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter(|p| !p.is_media())
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// True when there is no text and no part.
    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(text) => text.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }

    /// Length used by history budgeting.
    pub fn measured_len(&self) -> usize {
        match self {
            Content::Text(text) => text.chars().count(),
            Content::Parts(parts) => parts.iter().map(ContentPart::measured_len).sum(),
        }
    }

    /// Prepend `prefix` to the text of this content.
    ///
    /// For part lists the prefix becomes a new leading text part.
    pub fn prepend_text(&mut self, prefix: &str) {
        match self {
            Content::Text(text) => {
                *text = if text.is_empty() {
                    prefix.to_string()
                } else {
                    format!("{prefix}\n\n{text}")
                };
            }
            Content::Parts(parts) => parts.insert(0, ContentPart::text(prefix)),
        }
    }
}

/// Bookkeeping attached to every message. Never sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Stable identity of the message; never changes once assigned.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Marks an injected long-context summary.
    #[serde(default, skip_serializing_if = "is_false")]
    pub lci: bool,
    /// Media attached to this message, merged into its content on send.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multimodal: Option<Vec<ContentPart>>,
    /// Session metadata, carried by the system message at index 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl MessageInfo {
    /// Fresh info with a time-sortable id and the current timestamp.
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            time: Some(Utc::now()),
            lci: false,
            multimodal: None,
            chat_id: None,
            title: None,
        }
    }
}

impl Default for MessageInfo {
    fn default() -> Self {
        Self::new()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: Content,
    #[serde(default)]
    pub info: MessageInfo,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<Content>) -> Self {
        Self {
            kind,
            content: content.into(),
            info: MessageInfo::new(),
        }
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(MessageKind::System, content)
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(MessageKind::User { name: None }, content)
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::assistant_with_tool_calls(content, Vec::new())
    }

    pub fn assistant_with_tool_calls(content: impl Into<Content>, tool_calls: Vec<ToolCall>) -> Self {
        Self::new(
            MessageKind::Assistant {
                name: None,
                reasoning_content: None,
                tool_calls,
            },
            content,
        )
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::new(
            MessageKind::Tool {
                tool_call_id: tool_call_id.into(),
                name: None,
            },
            content,
        )
    }

    /// Builder-style replacement of the info block.
    pub fn with_info(mut self, info: MessageInfo) -> Self {
        self.info = info;
        self
    }

    pub fn role(&self) -> Role {
        self.kind.role()
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Text content of the message (media parts ignored).
    pub fn text(&self) -> String {
        self.content.text()
    }

    /// Tool calls emitted by an assistant message; empty for other roles.
    pub fn tool_calls(&self) -> &[ToolCall] {
        match &self.kind {
            MessageKind::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Call id a tool message answers, if this is a tool message.
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Tool { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }

    /// Reasoning text of an assistant message, if any.
    pub fn reasoning(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Assistant {
                reasoning_content, ..
            } => reasoning_content.as_deref(),
            _ => None,
        }
    }
}

/// Deserialize `null` as the type's default value.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
