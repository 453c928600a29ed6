//! JSON file session store.
//!
//! Each session is one file, `{chat_id}.json`, holding the ordered message
//! array with the system message (and its `chat_id`/`title` bookkeeping) at
//! index 0. Writes go to a temporary file that is renamed over the target,
//! so a crash never leaves a half-written session behind.
//!
//! Listing reads a companion `history_index.json` cache mapping file names to
//! `{mtime, title}` and only opens files whose modification time changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chatflow_core::chat::repository::SessionPersistence;
use chatflow_types::error::PersistenceError;
use chatflow_types::message::Message;
use chatflow_types::session::{SessionSnapshot, SessionSummary};

/// File name of the listing cache inside the sessions directory.
pub const INDEX_FILE: &str = "history_index.json";

/// Filesystem-backed implementation of `SessionPersistence`.
#[derive(Debug, Clone)]
pub struct JsonSessionStore {
    dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Private index cache types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    /// Modification time in milliseconds since the Unix epoch.
    mtime: i64,
    #[serde(default)]
    title: Option<String>,
}

type IndexCache = BTreeMap<String, IndexEntry>;

impl JsonSessionStore {
    /// Store sessions under `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Sessions directory inside a chatflow data directory.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("sessions"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, chat_id: &str) -> Result<PathBuf, PersistenceError> {
        if chat_id.is_empty()
            || chat_id.contains(['/', '\\'])
            || chat_id.starts_with('.')
        {
            return Err(PersistenceError::InvalidFormat(format!(
                "invalid chat id '{chat_id}'"
            )));
        }
        Ok(self.dir.join(format!("{chat_id}.json")))
    }

    async fn read_index(&self) -> IndexCache {
        let path = self.dir.join(INDEX_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return IndexCache::new(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to read index cache");
                return IndexCache::new();
            }
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "Ignoring corrupt index cache");
            IndexCache::new()
        })
    }

    async fn write_index(&self, index: &IndexCache) {
        let result = match serde_json::to_vec_pretty(index) {
            Ok(bytes) => write_atomic(&self.dir.join(INDEX_FILE), &bytes).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "Failed to update index cache");
        }
    }

    /// Read title and chat id from a session file's head.
    async fn read_head(path: &Path) -> Result<(String, Option<String>), PersistenceError> {
        let bytes = tokio::fs::read(path).await?;
        let messages: Vec<Message> = serde_json::from_slice(&bytes)?;
        let snapshot = SessionSnapshot::from_messages(messages).ok_or_else(missing_head)?;
        Ok((snapshot.chat_id, snapshot.title))
    }
}

fn missing_head() -> PersistenceError {
    PersistenceError::InvalidFormat(
        "first message must be a system message carrying a chat id".to_string(),
    )
}

fn mtime_millis(modified: SystemTime) -> i64 {
    DateTime::<Utc>::from(modified).timestamp_millis()
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

impl SessionPersistence for JsonSessionStore {
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        let path = self.path_for(&snapshot.chat_id)?;
        let bytes = serde_json::to_vec_pretty(&snapshot.messages)?;
        write_atomic(&path, &bytes).await?;
        tracing::trace!(path = %path.display(), bytes = bytes.len(), "Session file written");
        Ok(())
    }

    async fn load(&self, chat_id: &str) -> Result<SessionSnapshot, PersistenceError> {
        let path = self.path_for(chat_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersistenceError::NotFound(format!("{chat_id}.json")));
            }
            Err(err) => return Err(err.into()),
        };
        let messages: Vec<Message> = serde_json::from_slice(&bytes)?;
        let snapshot = SessionSnapshot::from_messages(messages).ok_or_else(missing_head)?;
        if snapshot.chat_id != chat_id {
            tracing::warn!(
                file = %path.display(),
                stored = %snapshot.chat_id,
                "Session file name and stored chat id differ"
            );
        }
        Ok(snapshot)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, PersistenceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let cached = self.read_index().await;
        let mut index = IndexCache::new();
        let mut summaries = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == INDEX_FILE || !file_name.ends_with(".json") {
                continue;
            }
            let Some(stem) = file_name.strip_suffix(".json") else {
                continue;
            };
            let modified = entry.metadata().await?.modified()?;
            let mtime = mtime_millis(modified);

            let title = match cached.get(&file_name) {
                Some(hit) if hit.mtime == mtime => hit.title.clone(),
                _ => match Self::read_head(&entry.path()).await {
                    Ok((_, title)) => title,
                    Err(err) => {
                        tracing::warn!(file = %file_name, error = %err, "Skipping unreadable session file");
                        continue;
                    }
                },
            };

            index.insert(
                file_name.clone(),
                IndexEntry {
                    mtime,
                    title: title.clone(),
                },
            );
            summaries.push(SessionSummary {
                chat_id: stem.to_string(),
                file_name,
                title,
                modified: DateTime::<Utc>::from(modified),
            });
        }

        if index != cached {
            self.write_index(&index).await;
        }

        summaries.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.chat_id.cmp(&b.chat_id)));
        Ok(summaries)
    }

    async fn delete(&self, chat_id: &str) -> Result<(), PersistenceError> {
        let path = self.path_for(chat_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(chat_id, "Session deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(PersistenceError::NotFound(format!("{chat_id}.json")))
            }
            Err(err) => Err(err.into()),
        }
    }
}
