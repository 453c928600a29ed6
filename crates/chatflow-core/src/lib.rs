//! Request orchestration for chatflow.
//!
//! Holds the session store and its autosave coordinator, the preprocessing
//! pipeline, the streaming rewriter, post-processing, and the request flow
//! engine. Transport, tool execution, and persistence are ports (traits)
//! implemented elsewhere; this crate never touches the network or disk.

pub mod chat;
pub mod event;
pub mod flow;
pub mod llm;
pub mod postprocess;
pub mod preprocess;
pub mod rewrite;
pub mod tool;
