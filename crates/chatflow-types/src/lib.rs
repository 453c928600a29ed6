//! Shared domain types for chatflow.
//!
//! Messages, tool calls, provider parameters, events, configuration and the
//! error taxonomy used across the workspace.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod llm;
pub mod message;
pub mod session;
pub mod tool;
