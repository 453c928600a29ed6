use thiserror::Error;
use uuid::Uuid;

use crate::llm::TransportError;

/// Errors from session history operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no message with id '{id}'")]
    NotFound { id: String },
}

/// Errors raised while turning a request pack into a payload.
///
/// Any of these aborts the send: a malformed payload never reaches the
/// network.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("message hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("history is empty")]
    EmptyHistory,

    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Failures of the request flow engine, by recoverability.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    /// Message-sequence invariant broken; the send is refused.
    #[error("ordering violation: {0}")]
    OrderingViolation(String),

    /// A response or decision arrived for a superseded request.
    #[error("stale request {request_id}")]
    StaleRequest { request_id: Uuid },

    /// A permission decision arrived with no batch waiting on it.
    #[error("no tool batch awaiting a decision for request {request_id}")]
    NoPendingToolBatch { request_id: Uuid },

    /// The last assistant turn has tool calls without results.
    #[error("assistant message '{message_id}' has unexecuted tool calls")]
    ToolNotExecuted { message_id: String },

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("security anomaly: {0}")]
    SecurityAnomaly(String),
}

impl FlowError {
    /// Whether the condition is handled without interrupting the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FlowError::StaleRequest { .. }
                | FlowError::NoPendingToolBatch { .. }
                | FlowError::ToolNotExecuted { .. }
                | FlowError::SecurityAnomaly(_)
        )
    }
}

/// Errors from the persistence backend.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("session file not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid session file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid session format: {0}")]
    InvalidFormat(String),
}

/// Errors reported by a tool registry for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("tool '{0}' is not registered")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Execution(String),
}

/// Errors compiling substitution rules.
#[derive(Debug, Clone, Error)]
pub enum RewriteError {
    #[error("invalid rewrite pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Errors from the web search facade. Never abort a send.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("search backend unavailable: {0}")]
    Unavailable(String),

    #[error("search failed: {0}")]
    Failed(String),
}

/// Errors loading configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::NotFound {
            id: "m-7".to_string(),
        };
        assert_eq!(err.to_string(), "no message with id 'm-7'");
    }

    #[test]
    fn test_flow_error_recoverability() {
        assert!(FlowError::StaleRequest {
            request_id: Uuid::now_v7()
        }
        .is_recoverable());
        assert!(FlowError::NoPendingToolBatch {
            request_id: Uuid::now_v7()
        }
        .is_recoverable());
        assert!(!FlowError::OrderingViolation("x".to_string()).is_recoverable());
        assert!(!FlowError::from(PipelineError::EmptyHistory).is_recoverable());
    }

    #[test]
    fn test_transport_error_converts() {
        let err: FlowError = TransportError::AuthenticationFailed.into();
        assert_eq!(err.to_string(), "transport error: authentication failed");
    }
}
