//! Session snapshot and history listing types.
//!
//! A [`SessionSnapshot`] is an owned, immutable copy of a session's history
//! handed to the persistence layer. The background writer only ever sees
//! snapshots, never the live session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};

/// Owned copy of a session's history at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub chat_id: String,
    pub title: Option<String>,
    pub messages: Vec<Message>,
}

impl SessionSnapshot {
    /// Build a snapshot from a message list, reading session metadata from
    /// the system message at index 0.
    ///
    /// Returns `None` if the list is empty, index 0 is not a system message,
    /// or it carries no `chat_id`.
    pub fn from_messages(messages: Vec<Message>) -> Option<Self> {
        let head = messages.first()?;
        if head.role() != Role::System {
            return None;
        }
        let chat_id = head.info.chat_id.clone()?;
        let title = head.info.title.clone();
        Some(Self {
            chat_id,
            title,
            messages,
        })
    }

    /// File name this snapshot is stored under.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.chat_id)
    }
}

/// One entry of the saved-history listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub file_name: String,
    pub chat_id: String,
    pub title: Option<String>,
    pub modified: DateTime<Utc>,
}
