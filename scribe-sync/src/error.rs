//! Crate-wide error taxonomy.
//!
//! Each layer owns a narrow error type (`StoreError`, `DocumentError`,
//! `FanoutError`, `ProtocolError`, `AuthError`); [`CollabError`] is what the
//! sync service and gateway surface to their callers.

use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::document::DocumentError;
use crate::fanout::FanoutError;
use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Errors surfaced by the sync service and the connection gateway.
#[derive(Debug, Error)]
pub enum CollabError {
    /// Bad or missing credential at connect time. Fatal to the connection.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(#[from] AuthError),

    /// The payload is not a valid update for this document family.
    #[error("corrupt update: {0}")]
    CorruptUpdate(String),

    /// The durable store is unavailable or returned garbage.
    #[error("storage error: {0}")]
    Storage(StoreError),

    /// Two appends were handed the same sequence. Indicates an isolation bug
    /// in the store; never retried.
    #[error("sequence {sequence} already assigned for document {document_id}")]
    SequenceConflict { document_id: Uuid, sequence: u64 },

    #[error("fanout error: {0}")]
    Fanout(#[from] FanoutError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl CollabError {
    /// Whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollabError::Storage(StoreError::Database(_)))
    }
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SequenceConflict { document_id, sequence } => {
                CollabError::SequenceConflict { document_id, sequence }
            }
            other => CollabError::Storage(other),
        }
    }
}

impl From<DocumentError> for CollabError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::CorruptUpdate(reason) => CollabError::CorruptUpdate(reason),
        }
    }
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;
