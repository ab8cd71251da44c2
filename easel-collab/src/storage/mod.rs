//! Durable storage for document state and version history.
//!
//! ```text
//! ┌──────────────────┐  load / save    ┌───────────────────────────────┐
//! │ PersistenceGate- │ ──────────────► │ dyn DocumentStore             │
//! │ way, VersionStore│                 │  ├─ RocksStore  (RocksDB)     │
//! └──────────────────┘                 │  └─ MemoryStore (in-process)  │
//!                                      └───────────────────────────────┘
//! ```
//!
//! The store only moves opaque blobs: it never decodes a replica.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Longest accepted document id, in bytes.
pub const MAX_DOC_ID_LEN: usize = 256;

/// Document identifier, taken from the socket path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    /// Validate a raw id: non-empty, bounded, no path separators or control
    /// characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let ok = !raw.is_empty()
            && raw.len() <= MAX_DOC_ID_LEN
            && !raw.chars().any(|c| c == '/' || c.is_control());
        ok.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

pub type VersionId = Uuid;

/// Why a version was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotTrigger {
    Manual,
    Interval,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub label: Option<String>,
    pub trigger: SnapshotTrigger,
    /// Set on the traceability snapshot appended after a restore.
    pub restored_from: Option<VersionId>,
}

impl SnapshotMeta {
    pub fn manual(label: Option<String>) -> Self {
        Self { label, trigger: SnapshotTrigger::Manual, restored_from: None }
    }

    pub fn interval() -> Self {
        Self { label: None, trigger: SnapshotTrigger::Interval, restored_from: None }
    }

    pub fn restore(from: VersionId, label: String) -> Self {
        Self { label: Some(label), trigger: SnapshotTrigger::Restore, restored_from: Some(from) }
    }
}

/// A full version row, state included (uncompressed).
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub id: VersionId,
    pub doc_id: DocId,
    pub meta: SnapshotMeta,
    pub created_at: DateTime<Utc>,
    pub state: Vec<u8>,
}

impl VersionRecord {
    pub fn new(doc_id: DocId, meta: SnapshotMeta, state: Vec<u8>) -> Self {
        Self { id: Uuid::new_v4(), doc_id, meta, created_at: Utc::now(), state }
    }
}

/// A version row without its state, as listed.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionInfo {
    pub id: VersionId,
    pub doc_id: DocId,
    pub meta: SnapshotMeta,
    pub created_at: DateTime<Utc>,
    /// Insertion sequence, breaks creation-time ties.
    pub seq: u64,
    /// Uncompressed state size in bytes.
    pub size: u64,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage task failed: {0}")]
    Task(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

/// Blob store for document state and version rows.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Latest saved state, `None` if the document was never saved.
    async fn load_state(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Upsert the full state.
    async fn save_state(&self, doc_id: &DocId, state: &[u8]) -> Result<(), StoreError>;

    /// Append a version row. The store assigns the insertion sequence.
    async fn append_version(&self, record: &VersionRecord) -> Result<VersionInfo, StoreError>;

    /// All version rows of a document, in insertion order.
    async fn list_versions(&self, doc_id: &DocId) -> Result<Vec<VersionInfo>, StoreError>;

    async fn get_version(&self, id: VersionId) -> Result<Option<VersionRecord>, StoreError>;

    /// Delete the given rows of `doc_id`. Ids of other documents are ignored.
    async fn delete_versions(&self, doc_id: &DocId, ids: &[VersionId]) -> Result<usize, StoreError>;
}
