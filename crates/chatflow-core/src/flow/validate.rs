//! Message-ordering checks run before a send.

use std::collections::HashSet;

use chatflow_types::error::FlowError;
use chatflow_types::event::RequestType;
use chatflow_types::message::{Message, Role};
use chatflow_types::tool::ToolCall;

/// An assistant turn whose tool calls have not all been answered.
#[derive(Debug, Clone, PartialEq)]
pub struct UnexecutedCalls {
    pub message_id: String,
    /// Unanswered calls with their index in the assistant's `tool_calls`.
    pub calls: Vec<(usize, ToolCall)>,
}

/// Find tool calls of the last assistant turn that have no result yet.
///
/// Only applies while no user message follows that turn.
pub fn unexecuted_tool_calls(history: &[Message]) -> Option<UnexecutedCalls> {
    let index = history.iter().rposition(|m| m.role() == Role::Assistant)?;
    let assistant = &history[index];
    let later = &history[index + 1..];
    if later.iter().any(|m| m.role() == Role::User) {
        return None;
    }

    let answered: HashSet<&str> = later.iter().filter_map(Message::tool_call_id).collect();
    let calls: Vec<(usize, ToolCall)> = assistant
        .tool_calls()
        .iter()
        .enumerate()
        .filter(|(_, call)| !answered.contains(call.id.as_str()))
        .map(|(i, call)| (i, call.clone()))
        .collect();

    (!calls.is_empty()).then(|| UnexecutedCalls {
        message_id: assistant.id().to_string(),
        calls,
    })
}

/// Check that `history` is in a state where `request_type` may be sent.
pub fn validate_order(history: &[Message], request_type: RequestType) -> Result<(), FlowError> {
    let last_index = |role: Role| history.iter().rposition(|m| m.role() == role);

    match request_type {
        RequestType::UserMessage => {
            let user = last_index(Role::User).ok_or_else(|| {
                FlowError::OrderingViolation("no user message to answer".to_string())
            })?;
            match last_index(Role::Assistant) {
                Some(assistant) if user < assistant => Err(FlowError::OrderingViolation(
                    "last user message is already answered".to_string(),
                )),
                _ => Ok(()),
            }
        }
        RequestType::ToolMessage => {
            let last = history.iter().rev().find(|m| m.role() != Role::System);
            match last.map(Message::role) {
                Some(Role::Tool) => Ok(()),
                other => Err(FlowError::OrderingViolation(format!(
                    "tool continuation requires a tool result last, found {}",
                    other.map_or_else(|| "nothing".to_string(), |r| r.to_string())
                ))),
            }
        }
        RequestType::AssistantContinue => match history.last().map(Message::role) {
            Some(Role::Assistant) => Ok(()),
            other => Err(FlowError::OrderingViolation(format!(
                "continuation requires an assistant message last, found {}",
                other.map_or_else(|| "nothing".to_string(), |r| r.to_string())
            ))),
        },
    }
}
