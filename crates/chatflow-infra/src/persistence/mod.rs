//! Session persistence adapters.
//!
//! Implements `SessionPersistence` from `chatflow-core` on top of plain JSON
//! files in the data directory.

pub mod json_store;

pub use json_store::JsonSessionStore;
