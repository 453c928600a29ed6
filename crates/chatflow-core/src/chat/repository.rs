//! SessionPersistence trait definition.
//!
//! The autosave coordinator and the CLI persist sessions through this port.
//! Implementations live in chatflow-infra (e.g., `JsonSessionStore`).

use std::future::Future;

use chatflow_types::error::PersistenceError;
use chatflow_types::session::{SessionSnapshot, SessionSummary};

/// Storage backend for session snapshots.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait SessionPersistence: Send + Sync + 'static {
    /// Durably store a snapshot, replacing any earlier copy of the session.
    fn save(
        &self,
        snapshot: &SessionSnapshot,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Load a session by chat id.
    fn load(
        &self,
        chat_id: &str,
    ) -> impl Future<Output = Result<SessionSnapshot, PersistenceError>> + Send;

    /// List stored sessions, most recently modified first.
    fn list(&self) -> impl Future<Output = Result<Vec<SessionSummary>, PersistenceError>> + Send;

    /// Remove a stored session.
    fn delete(&self, chat_id: &str) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}
