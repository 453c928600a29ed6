//! Session store for a single conversation.
//!
//! `SessionStore` owns the ordered message history plus the round and
//! character counters used by optimization passes. It is a cheap-to-clone
//! handle: every clone sees the same history, and every mutation goes through
//! the methods here. When an autosave handle is attached, each mutation hands
//! the coordinator an owned snapshot; the live history never leaves the lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatflow_types::error::SessionError;
use chatflow_types::message::{Content, Message, MessageInfo, Role};
use chatflow_types::session::SessionSnapshot;
use uuid::Uuid;

use super::autosave::AutosaveHandle;

/// Number of trailing messages whose length is cached as the chat length.
const CACHED_LENGTH_SUFFIX: usize = 20;

/// Round and character counters, reset by the optimization subsystems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    /// Rounds since the last long-context summary.
    pub new_chat_rounds: u32,
    /// Rounds since the last background optimization.
    pub new_background_rounds: u32,
    /// Characters appended since the last long-context summary.
    pub chars_since_lci: usize,
    /// Characters appended since the last background optimization.
    pub chars_since_background: usize,
}

#[derive(Debug)]
struct SessionState {
    chat_id: String,
    messages: Vec<Message>,
    counters: SessionCounters,
    cached_length: usize,
    autosave: Option<AutosaveHandle>,
}

impl SessionState {
    fn last_index(&self, role: Option<Role>) -> Option<usize> {
        match role {
            None => self.messages.len().checked_sub(1),
            Some(role) => self.messages.iter().rposition(|m| m.role() == role),
        }
    }

    fn length_of_last(&self, n: usize) -> usize {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..]
            .iter()
            .map(|m| m.content.measured_len())
            .sum()
    }

    fn snapshot(&self) -> Option<SessionSnapshot> {
        SessionSnapshot::from_messages(self.messages.clone())
    }

    /// Refresh derived state and hand a snapshot to autosave.
    fn changed(&mut self) {
        self.cached_length = self.length_of_last(CACHED_LENGTH_SUFFIX);
        if let Some(autosave) = &self.autosave {
            match self.snapshot() {
                Some(snapshot) => autosave.request(snapshot),
                None => tracing::warn!(
                    chat_id = %self.chat_id,
                    "Session head is not a system message with a chat id, skipping autosave"
                ),
            }
        }
    }
}

/// Shared handle to one conversation's history.
///
/// Index 0 is always the system message carrying the session's `chat_id`.
/// History only grows by appends and only shrinks from the tail.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<SessionState>>,
}

impl SessionStore {
    /// Create an empty session with a synthetic system message.
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let chat_id = Uuid::now_v7().to_string();
        let mut info = MessageInfo::new();
        info.chat_id = Some(chat_id.clone());
        let system = Message::system(system_prompt.into()).with_info(info);
        Self::from_parts(chat_id, vec![system])
    }

    /// Rebuild a session from a persisted snapshot.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self::from_parts(snapshot.chat_id, snapshot.messages)
    }

    fn from_parts(chat_id: String, messages: Vec<Message>) -> Self {
        let mut state = SessionState {
            chat_id,
            messages,
            counters: SessionCounters::default(),
            cached_length: 0,
            autosave: None,
        };
        state.cached_length = state.length_of_last(CACHED_LENGTH_SUFFIX);
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route every future mutation's snapshot to `handle`.
    pub fn attach_autosave(&self, handle: AutosaveHandle) {
        self.lock().autosave = Some(handle);
    }

    /// Stop requesting saves; returns the previously attached handle.
    pub fn detach_autosave(&self) -> Option<AutosaveHandle> {
        self.lock().autosave.take()
    }

    pub fn chat_id(&self) -> String {
        self.lock().chat_id.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    /// Owned copy of the full history.
    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    /// Owned snapshot for persistence, if the head carries session metadata.
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.lock().snapshot()
    }

    /// Append one message to the end of the history.
    pub fn append(&self, message: Message) {
        self.append_many(vec![message]);
    }

    /// Append several messages under one lock, preserving their order.
    pub fn append_many(&self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.lock();
        let added: usize = messages.iter().map(|m| m.content.measured_len()).sum();
        state.counters.chars_since_lci += added;
        state.counters.chars_since_background += added;
        state.messages.extend(messages);
        state.changed();
    }

    /// Remove every message after the one with `id`.
    ///
    /// With `include_target` the target itself is kept; without it the target
    /// is removed too. The system message at index 0 is never removed.
    /// Returns the number of removed messages.
    pub fn truncate_to(&self, id: &str, include_target: bool) -> Result<usize, SessionError> {
        let mut state = self.lock();
        let position = state
            .messages
            .iter()
            .rposition(|m| m.id() == id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;

        let keep = if include_target { position + 1 } else { position };
        let keep = keep.max(1).min(state.messages.len());
        let removed = state.messages.len() - keep;
        state.messages.truncate(keep);
        if removed > 0 {
            state.changed();
        }
        Ok(removed)
    }

    /// Pop trailing non-user messages so the history ends on a user turn.
    ///
    /// Returns the number of removed messages.
    pub fn truncate_to_last_user(&self) -> usize {
        let mut state = self.lock();
        let mut removed = 0;
        while state.messages.len() > 1
            && state.messages.last().is_some_and(|m| m.role() != Role::User)
        {
            state.messages.pop();
            removed += 1;
        }
        if removed > 0 {
            state.changed();
        }
        removed
    }

    /// Last message, optionally restricted to `role`.
    pub fn get_last(&self, role: Option<Role>) -> Option<Message> {
        let state = self.lock();
        state.last_index(role).map(|i| state.messages[i].clone())
    }

    /// Index of the last message, optionally restricted to `role`.
    pub fn get_last_index(&self, role: Option<Role>) -> Option<usize> {
        self.lock().last_index(role)
    }

    /// Measured length of the last `n` messages.
    ///
    /// Media parts count as a fixed cost; see [`Content::measured_len`].
    pub fn length_of_last_n_messages(&self, n: usize) -> usize {
        self.lock().length_of_last(n)
    }

    /// Length of the trailing messages, cached on every mutation.
    pub fn chat_length(&self) -> usize {
        self.lock().cached_length
    }

    /// Replace the content of the message with `id`. Its identity is kept.
    pub fn edit_content(&self, id: &str, content: Content) -> Result<(), SessionError> {
        let mut state = self.lock();
        let message = state
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.id() == id)
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })?;
        message.content = content;
        state.changed();
        Ok(())
    }

    /// Replace the system prompt at index 0.
    pub fn replace_system_prompt(&self, prompt: impl Into<String>) {
        let mut state = self.lock();
        if let Some(head) = state.messages.first_mut() {
            head.content = Content::Text(prompt.into());
            state.changed();
        }
    }

    /// Set the session title stored on the system message.
    pub fn set_title(&self, title: impl Into<String>) {
        let mut state = self.lock();
        if let Some(head) = state.messages.first_mut() {
            head.info.title = Some(title.into());
            state.changed();
        }
    }

    pub fn counters(&self) -> SessionCounters {
        self.lock().counters
    }

    /// Count one completed user/assistant exchange.
    pub fn record_chat_round(&self) {
        let mut state = self.lock();
        state.counters.new_chat_rounds += 1;
        state.counters.new_background_rounds += 1;
    }

    /// Called after a long-context summary was produced.
    pub fn reset_chat_rounds(&self) {
        let mut state = self.lock();
        state.counters.new_chat_rounds = 0;
        state.counters.chars_since_lci = 0;
    }

    /// Called after a background optimization pass.
    pub fn reset_background_rounds(&self) {
        let mut state = self.lock();
        state.counters.new_background_rounds = 0;
        state.counters.chars_since_background = 0;
    }
}
