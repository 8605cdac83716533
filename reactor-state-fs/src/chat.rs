//! Chat lifecycle (C6): create/list/save/load/delete, each chat backed by
//! its own directory holding `metadata.json`, `history.json`,
//! `scratchpad.json`, and a `memory/` subdirectory for its L3 index.
//!
//! Grounded directly on [`crate::FsStore`]'s conventions (`tokio::fs`
//! throughout, one JSON file per record) but every write here goes
//! through [`write_atomic`], which that store's own writer does not do:
//! contents land in a sibling `.tmp` file first and are only renamed over
//! the target once fully written, so a crash mid-save can never leave a
//! chat half-written.

use reactor_context::{HistoryBlock, Scratchpad};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Small, filesystem-safe identifiers only: this is a local agent's own
/// chat directory names, not arbitrary user-controlled paths.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Persisted identity and timestamps for a chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMetadata {
    /// Stable identifier, also the directory name (sanitized).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last successful save.
    pub updated_at: u64,
}

/// A full chat: identity, compressed history, and scratchpad. Project
/// memory lives separately under [`ChatStore::memory_dir`], not inline.
#[derive(Debug, Clone, PartialEq)]
pub struct Chat {
    /// This chat's metadata.
    pub metadata: ChatMetadata,
    /// L2 history.
    pub history: HistoryBlock,
    /// L1 scratchpad.
    pub scratchpad: Scratchpad,
}

/// Errors from chat persistence.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ChatStoreError {
    /// Underlying filesystem operation failed.
    #[error("chat store io error: {0}")]
    Io(String),

    /// A chat file's contents could not be parsed.
    #[error("chat store serialization error: {0}")]
    Serialization(String),

    /// No chat exists with the given id.
    #[error("no chat named {0}")]
    NotFound(String),

    /// `create` was called with an id that already has a directory.
    #[error("a chat named {0} already exists")]
    AlreadyExists(String),

    /// `delete` was called on the chat currently active in this store.
    #[error("cannot delete {0}, it is the active chat")]
    ActiveChat(String),
}

/// Filesystem-backed chat lifecycle manager.
///
/// Directory layout:
/// ```text
/// root/
///   memory/              <- global L3 index
///   chats/
///     <sanitized-id>/
///       metadata.json
///       history.json
///       scratchpad.json
///       memory/          <- this chat's L3 index
/// ```
pub struct ChatStore {
    root: PathBuf,
    /// The chat most recently returned by `load`/`switch`, one per agent
    /// instance. `delete` refuses to remove it.
    active: std::sync::Mutex<Option<String>>,
}

impl ChatStore {
    /// Open a chat store rooted at `root`. Directories are created lazily
    /// as chats are created.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            active: std::sync::Mutex::new(None),
        }
    }

    fn chat_dir(&self, id: &str) -> PathBuf {
        self.root.join("chats").join(sanitize(id))
    }

    /// Directory backing the global (cross-chat) L3 index.
    pub fn global_memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }

    /// Directory backing a single chat's L3 index.
    pub fn memory_dir(&self, id: &str) -> PathBuf {
        self.chat_dir(id).join("memory")
    }

    /// Create a new, empty chat. Fails if `id` is already in use.
    pub async fn create(&self, id: &str, name: &str) -> Result<Chat, ChatStoreError> {
        let dir = self.chat_dir(id);
        if tokio::fs::metadata(&dir).await.is_ok() {
            return Err(ChatStoreError::AlreadyExists(id.to_string()));
        }
        let now = now_unix();
        let chat = Chat {
            metadata: ChatMetadata {
                id: id.to_string(),
                name: name.to_string(),
                description: None,
                created_at: now,
                updated_at: now,
            },
            history: HistoryBlock::new(),
            scratchpad: Scratchpad::new(String::new()),
        };
        self.save(&chat).await?;
        Ok(chat)
    }

    /// Persist `chat`'s metadata, history, and scratchpad, each via
    /// write-temp-then-rename. Updates `updated_at` is the caller's
    /// responsibility (callers typically bump it right before saving).
    pub async fn save(&self, chat: &Chat) -> Result<(), ChatStoreError> {
        let dir = self.chat_dir(&chat.metadata.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ChatStoreError::Io(e.to_string()))?;
        tokio::fs::create_dir_all(dir.join("memory"))
            .await
            .map_err(|e| ChatStoreError::Io(e.to_string()))?;

        write_atomic(&dir.join("metadata.json"), &chat.metadata).await?;
        write_atomic(&dir.join("history.json"), &chat.history).await?;
        write_atomic(&dir.join("scratchpad.json"), &chat.scratchpad).await?;
        Ok(())
    }

    /// Load a chat's metadata, history, and scratchpad from disk.
    pub async fn load(&self, id: &str) -> Result<Chat, ChatStoreError> {
        let dir = self.chat_dir(id);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Err(ChatStoreError::NotFound(id.to_string()));
        }
        let metadata = read_json(&dir.join("metadata.json")).await?;
        let history = read_json(&dir.join("history.json")).await?;
        let scratchpad = read_json(&dir.join("scratchpad.json")).await?;
        *self.active.lock().unwrap() = Some(id.to_string());
        Ok(Chat {
            metadata,
            history,
            scratchpad,
        })
    }

    /// Load `target`, marking it the active chat. `delete` refuses to
    /// remove whichever chat was most recently loaded or switched to.
    pub async fn switch(&self, target: &str) -> Result<Chat, ChatStoreError> {
        self.load(target).await
    }

    /// List every chat's metadata, in no particular order.
    pub async fn list(&self) -> Result<Vec<ChatMetadata>, ChatStoreError> {
        let chats_dir = self.root.join("chats");
        let mut entries = match tokio::fs::read_dir(&chats_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ChatStoreError::Io(e.to_string())),
        };

        let mut result = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ChatStoreError::Io(e.to_string()))?
        {
            let metadata_path = entry.path().join("metadata.json");
            if tokio::fs::metadata(&metadata_path).await.is_ok() {
                result.push(read_json(&metadata_path).await?);
            }
        }
        Ok(result)
    }

    /// Delete a chat and its entire directory (history, scratchpad, and
    /// its chat-scoped L3 index). Deleting a chat that doesn't exist is
    /// not an error. Refuses to delete the active chat (see [`Self::load`]
    /// and [`Self::switch`]).
    pub async fn delete(&self, id: &str) -> Result<(), ChatStoreError> {
        if self.active.lock().unwrap().as_deref() == Some(id) {
            return Err(ChatStoreError::ActiveChat(id.to_string()));
        }
        match tokio::fs::remove_dir_all(self.chat_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatStoreError::Io(e.to_string())),
        }
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ChatStoreError> {
    let contents =
        serde_json::to_string_pretty(value).map_err(|e| ChatStoreError::Serialization(e.to_string()))?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|e| ChatStoreError::Io(e.to_string()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ChatStoreError::Io(e.to_string()))?;
    Ok(())
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ChatStoreError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ChatStoreError::Io(e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| ChatStoreError::Serialization(e.to_string()))
}
