//! Durable update log and snapshot store.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  append / since   ┌──────────────────────────────────┐
//! │ SyncService │ ────────────────► │ UpdateLog                        │
//! │             │                   │   updates  (doc_id, sequence)    │
//! │             │                   │   sequences (doc_id → last)      │
//! │             │  latest / save    ├──────────────────────────────────┤
//! │             │ ────────────────► │ SnapshotStore                    │
//! └─────────────┘                   │   snapshots (doc_id, covered)    │
//!                                   └──────────────────────────────────┘
//!                                     RocksStore (embedded, one process)
//!                                     SqlStore   (SQLite / PostgreSQL)
//! ```
//!
//! Sequence assignment is the only critical section: the next sequence and
//! the update row are committed together, so two appenders for the same
//! document can never observe the same counter value.

pub mod rocks;
pub mod sql;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

pub use rocks::{RocksStore, StoreConfig};
pub use sql::{DbKind, SqlStore};

/// One client edit as recorded in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    pub document_id: Uuid,
    /// Monotonic per document, starts at 1
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub author_id: Uuid,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
}

/// Compacted full state covering every update up to `covered_sequence`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document_id: Uuid,
    pub covered_sequence: u64,
    /// Full-state update
    pub state: Vec<u8>,
    pub state_vector: Vec<u8>,
    pub created_at: u64,
}

impl DocumentSnapshot {
    pub fn new(
        document_id: Uuid,
        covered_sequence: u64,
        state: Vec<u8>,
        state_vector: Vec<u8>,
    ) -> Self {
        Self {
            document_id,
            covered_sequence,
            state,
            state_vector,
            created_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backend unavailable or failed mid-operation
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    /// A stored row already holds the sequence being assigned
    #[error("sequence {sequence} already exists for document {document_id}")]
    SequenceConflict { document_id: Uuid, sequence: u64 },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Append-only, per-document sequence of opaque update blobs.
#[async_trait]
pub trait UpdateLog: Send + Sync {
    /// Updates with sequence strictly greater than `sequence`, ascending.
    async fn updates_since(
        &self,
        document_id: Uuid,
        sequence: u64,
    ) -> Result<Vec<DocumentUpdate>, StoreError>;

    /// Assign the next sequence and durably store the update, atomically.
    async fn append_update(
        &self,
        document_id: Uuid,
        payload: &[u8],
        author_id: Uuid,
    ) -> Result<DocumentUpdate, StoreError>;

    /// Delete every update with sequence ≤ `sequence`. Idempotent.
    async fn delete_updates_up_to(&self, document_id: Uuid, sequence: u64)
        -> Result<u64, StoreError>;

    /// Last sequence handed out for the document (0 if none).
    async fn head_sequence(&self, document_id: Uuid) -> Result<u64, StoreError>;
}

/// Append-only history of compacted snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The snapshot with the highest `covered_sequence`.
    async fn latest_snapshot(
        &self,
        document_id: Uuid,
    ) -> Result<Option<DocumentSnapshot>, StoreError>;

    async fn save_snapshot(
        &self,
        snapshot: DocumentSnapshot,
    ) -> Result<DocumentSnapshot, StoreError>;
}

/// Everything the sync service needs from durable storage.
pub trait DocumentStore: UpdateLog + SnapshotStore {}

impl<T: UpdateLog + SnapshotStore + ?Sized> DocumentStore for T {}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
