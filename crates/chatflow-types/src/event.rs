//! Event types emitted by the request flow engine.
//!
//! `FlowEvent` is broadcast on the event bus; every variant is Clone + Send
//! so it can travel over `tokio::sync::broadcast`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::message::Message;
use crate::tool::ToolCallRecord;

/// Why a request is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// A new user message was appended.
    UserMessage,
    /// Tool results were appended and the model should react to them.
    ToolMessage,
    /// The model should continue its own last message.
    AssistantContinue,
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestType::UserMessage => write!(f, "user_message"),
            RequestType::ToolMessage => write!(f, "tool_message"),
            RequestType::AssistantContinue => write!(f, "assistant_continue"),
        }
    }
}

impl FromStr for RequestType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_message" => Ok(RequestType::UserMessage),
            "tool_message" => Ok(RequestType::ToolMessage),
            "assistant_continue" => Ok(RequestType::AssistantContinue),
            other => Err(format!("invalid request type: '{other}'")),
        }
    }
}

/// Lifecycle state of the flow engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Sending,
    Streaming,
    ToolEvaluation,
    ToolPermissionPending,
    ToolExecuting,
    Resending,
    Paused,
    Abandoned,
}

impl EngineState {
    /// True for every state except `Idle`.
    pub fn is_busy(&self) -> bool {
        !matches!(self, EngineState::Idle)
    }
}

/// Class of a user-visible failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OrderingViolation,
    Pipeline,
    Transport,
}

/// Events emitted during request execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// A request was handed to a background task.
    RequestStarted {
        request_id: Uuid,
        request_type: RequestType,
    },

    /// Newly visible assistant text, after rewriting.
    ContentDelta { request_id: Uuid, text: String },

    /// The whole rewritten assistant text received so far.
    FullContent { request_id: Uuid, text: String },

    /// A chunk of reasoning text.
    ReasoningDelta { request_id: Uuid, text: String },

    /// An assistant turn with tool calls was appended to history.
    UpdateMessage { request_id: Uuid, message: Message },

    /// Some calls need an explicit decision before the batch may run.
    AskForToolPermission {
        request_id: Uuid,
        allowed: Vec<ToolCallRecord>,
        denied: Vec<ToolCallRecord>,
    },

    /// Tool result messages were appended to history, in call order.
    ToolResults {
        request_id: Uuid,
        messages: Vec<Message>,
        will_resend: bool,
    },

    /// The final assistant turn was appended to history.
    Finished {
        request_id: Uuid,
        message: Message,
        finish_reason: Option<String>,
    },

    /// The current request was paused by the user.
    Paused { request_id: Uuid },

    /// A non-fatal anomaly in a response.
    Warning { request_id: Uuid, message: String },

    /// A tool call arrived that the request never offered.
    SecurityWarning { request_id: Uuid, message: String },

    /// A request failed; the engine is back in `Idle`.
    Error {
        request_id: Option<Uuid>,
        kind: ErrorKind,
        message: String,
    },

    /// The engine changed state.
    StateChanged { state: EngineState },
}

impl FlowEvent {
    /// Request this event belongs to, if any.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            FlowEvent::RequestStarted { request_id, .. }
            | FlowEvent::ContentDelta { request_id, .. }
            | FlowEvent::FullContent { request_id, .. }
            | FlowEvent::ReasoningDelta { request_id, .. }
            | FlowEvent::UpdateMessage { request_id, .. }
            | FlowEvent::AskForToolPermission { request_id, .. }
            | FlowEvent::ToolResults { request_id, .. }
            | FlowEvent::Finished { request_id, .. }
            | FlowEvent::Paused { request_id }
            | FlowEvent::Warning { request_id, .. }
            | FlowEvent::SecurityWarning { request_id, .. } => Some(*request_id),
            FlowEvent::Error { request_id, .. } => *request_id,
            FlowEvent::StateChanged { .. } => None,
        }
    }
}
