//! Conversation state: the session store, its persistence port, and the
//! autosave coordinator that writes snapshots in the background.

pub mod autosave;
pub mod repository;
pub mod session;
