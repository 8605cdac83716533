#![deny(missing_docs)]
//! Per-scope vector memory (L3) for the agent loop.
//!
//! Two kinds of scope exist: a single `global` index shared by every chat,
//! and one index per `chat:<id>`. A search issued against a set of scopes
//! unions their candidates and ranks by cosine similarity before truncating
//! to `k`. Records are immutable except for `importance`; deletion is
//! explicit and scoped (deleting from `chat:A` never touches `chat:B` or
//! `global`).
//!
//! Persistence mirrors the filesystem state store's conventions (scope
//! hashed into a directory name, `tokio::fs` throughout) but writes each
//! scope's records as a single JSON-lines file, replaced atomically via a
//! sibling `.tmp` file plus rename so a crash mid-write cannot corrupt a
//! prior-good index.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::RwLock;

/// Which memory index a record belongs to, or a query targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryScope {
    /// Shared across every chat.
    Global,
    /// Scoped to a single chat.
    Chat(String),
}

impl MemoryScope {
    /// Canonical string form: `"global"` or `"chat:<id>"`.
    pub fn key(&self) -> String {
        match self {
            MemoryScope::Global => "global".to_string(),
            MemoryScope::Chat(id) => format!("chat:{id}"),
        }
    }
}

/// A single retained fact plus the embedding used to retrieve it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique within its scope.
    pub id: String,
    /// The retained text.
    pub text: String,
    /// Embedding vector; dimension is fixed for the life of the index.
    pub embedding: Vec<f32>,
    /// Caller-assigned importance in `[0, 1]`.
    pub importance: f32,
    /// The scope this record lives in.
    pub scope: MemoryScope,
    /// Unix timestamp (seconds) at insertion.
    pub created_at: u64,
}

/// Errors from embedding text or operating on a memory index.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MemoryError {
    /// A record's embedding does not match the index's fixed dimension.
    #[error("embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension established by the first record added to the index.
        expected: usize,
        /// Dimension of the rejected embedding.
        actual: usize,
    },

    /// The embedding provider failed.
    #[error("embedding request failed: {0}")]
    Embedding(String),

    /// Underlying filesystem operation failed.
    #[error("memory index io error: {0}")]
    Io(String),

    /// Index file contents could not be parsed.
    #[error("memory index serialization error: {0}")]
    Serialization(String),

    /// `delete` was called with an id not present in the scope.
    #[error("no record {0} in this scope")]
    NotFound(String),
}

/// Produces an embedding vector for a piece of text.
///
/// Implemented once against the process's single loaded embedding model
/// and held for the process lifetime; not object-safe (mirrors `Provider`).
pub trait Embedder: Send + Sync {
    /// Embed `text`, returning a fixed-dimension vector.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, MemoryError>> + Send;
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Derive a filesystem-safe directory name from a scope key, matching the
/// state store's scope-hashing convention.
fn scope_dir_name(scope: &MemoryScope) -> String {
    let key = scope.key();
    let mut hash: u64 = 5381;
    for byte in key.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(*byte as u64);
    }
    format!("scope-{hash:016x}")
}

/// A search hit: the record plus its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryHit {
    /// The matched record.
    pub record: MemoryRecord,
    /// Cosine similarity to the query embedding, in `[-1, 1]`.
    pub similarity: f32,
}

/// Per-scope brute-force vector index, mirrored to disk.
///
/// Each scope's records live in memory as a `Vec<MemoryRecord>` guarded by
/// an `RwLock`, loaded from disk on first access and rewritten atomically
/// on every mutation.
pub struct MemoryStore {
    root: PathBuf,
    scopes: RwLock<HashMap<String, Arc<RwLock<Vec<MemoryRecord>>>>>,
}

impl MemoryStore {
    /// Open (without yet reading) a memory store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scopes: RwLock::new(HashMap::new()),
        }
    }

    fn scope_path(&self, scope: &MemoryScope) -> PathBuf {
        self.root.join(scope_dir_name(scope)).join("records.jsonl")
    }

    async fn index_for(&self, scope: &MemoryScope) -> Result<Arc<RwLock<Vec<MemoryRecord>>>, MemoryError> {
        let key = scope.key();
        if let Some(existing) = self.scopes.read().await.get(&key) {
            return Ok(existing.clone());
        }
        let mut scopes = self.scopes.write().await;
        if let Some(existing) = scopes.get(&key) {
            return Ok(existing.clone());
        }
        let records = load_scope(&self.scope_path(scope)).await?;
        let handle = Arc::new(RwLock::new(records));
        scopes.insert(key, handle.clone());
        Ok(handle)
    }

    /// Insert a new record into `scope`, returning its id.
    ///
    /// The first record added to a scope fixes that scope's embedding
    /// dimension; subsequent additions with a mismatched dimension are
    /// rejected.
    pub async fn add(
        &self,
        scope: MemoryScope,
        text: impl Into<String>,
        embedding: Vec<f32>,
        importance: f32,
    ) -> Result<String, MemoryError> {
        let index = self.index_for(&scope).await?;
        let mut records = index.write().await;
        if let Some(existing) = records.first() {
            if existing.embedding.len() != embedding.len() {
                return Err(MemoryError::DimensionMismatch {
                    expected: existing.embedding.len(),
                    actual: embedding.len(),
                });
            }
        }
        let record = MemoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            embedding,
            importance: importance.clamp(0.0, 1.0),
            scope: scope.clone(),
            created_at: now_unix(),
        };
        let id = record.id.clone();
        records.push(record);
        persist_scope(&self.scope_path(&scope), &records).await?;
        Ok(id)
    }

    /// Search the union of `scopes` for the top `k` records by cosine
    /// similarity to `query_embedding`, descending.
    pub async fn search(
        &self,
        scopes: &[MemoryScope],
        query_embedding: &[f32],
        k: usize,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let mut hits = Vec::new();
        for scope in scopes {
            let index = self.index_for(scope).await?;
            let records = index.read().await;
            for record in records.iter() {
                if record.embedding.len() != query_embedding.len() {
                    continue;
                }
                hits.push(MemoryHit {
                    record: record.clone(),
                    similarity: cosine_similarity(&record.embedding, query_embedding),
                });
            }
        }
        hits.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    /// Remove a record by id from exactly one scope.
    pub async fn delete(&self, scope: &MemoryScope, id: &str) -> Result<(), MemoryError> {
        let index = self.index_for(scope).await?;
        let mut records = index.write().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(MemoryError::NotFound(id.to_string()));
        }
        persist_scope(&self.scope_path(scope), &records).await?;
        Ok(())
    }

    /// Update `importance` on an existing record; the only mutable field.
    pub async fn set_importance(
        &self,
        scope: &MemoryScope,
        id: &str,
        importance: f32,
    ) -> Result<(), MemoryError> {
        let index = self.index_for(scope).await?;
        let mut records = index.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        record.importance = importance.clamp(0.0, 1.0);
        persist_scope(&self.scope_path(scope), &records).await?;
        Ok(())
    }

    /// Number of records currently held in `scope` (loads it if not yet
    /// resident).
    pub async fn len(&self, scope: &MemoryScope) -> Result<usize, MemoryError> {
        let index = self.index_for(scope).await?;
        Ok(index.read().await.len())
    }
}

async fn load_scope(path: &Path) -> Result<Vec<MemoryRecord>, MemoryError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MemoryError::Io(e.to_string())),
    };
    let mut records = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record: MemoryRecord =
            serde_json::from_str(line).map_err(|e| MemoryError::Serialization(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

async fn persist_scope(path: &Path, records: &[MemoryRecord]) -> Result<(), MemoryError> {
    let dir = path.parent().expect("scope path always has a parent");
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| MemoryError::Io(e.to_string()))?;

    let mut body = String::new();
    for record in records {
        let line = serde_json::to_string(record).map_err(|e| MemoryError::Serialization(e.to_string()))?;
        body.push_str(&line);
        body.push('\n');
    }

    let tmp_path = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp_path, body)
        .await
        .map_err(|e| MemoryError::Io(e.to_string()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| MemoryError::Io(e.to_string()))?;
    Ok(())
}
