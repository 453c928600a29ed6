//! ToolRegistry trait definition.
//!
//! The flow engine executes allowed tool calls through this trait. How a tool
//! is implemented, sandboxed, or discovered is up to the implementor.

use std::future::Future;

use chatflow_types::error::ToolError;
use chatflow_types::tool::{ToolCall, ToolSpec};

/// Executes tool calls in provider format.
///
/// Must be safe to call concurrently for independent calls: the engine runs
/// every allowed call of a batch in parallel.
pub trait ToolRegistry: Send + Sync {
    /// Specs of every tool this registry can run.
    fn specs(&self) -> Vec<ToolSpec>;

    /// Run one call and return its textual result.
    fn call(&self, call: &ToolCall) -> impl Future<Output = Result<String, ToolError>> + Send;
}
