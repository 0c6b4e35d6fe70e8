//! Mergeable document capability.
//!
//! The sync engine never looks inside replicated state. It only needs the
//! five operations of [`MergeableDocument`]; [`YrsDocument`] provides them on
//! top of a `yrs` text CRDT.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

/// Name of the root text shared by every replica.
pub const CONTENT_ROOT: &str = "content";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("{0}")]
    CorruptUpdate(String),
}

/// A CRDT state object whose merge is commutative, associative and idempotent.
pub trait MergeableDocument: Send + Sync + Sized + 'static {
    /// A fresh, empty replica.
    fn create() -> Self;

    /// Apply an opaque update in place.
    fn merge(&mut self, update: &[u8]) -> Result<(), DocumentError>;

    /// An update that reproduces this replica's full state on a fresh one.
    fn encode_full(&self) -> Vec<u8>;

    /// Compact summary of the applied-update set, for diffing.
    fn encode_state_vector(&self) -> Vec<u8>;

    fn materialize(&self) -> String;

    /// Parse-only validation. The default merges into a scratch replica.
    fn check_update(update: &[u8]) -> Result<(), DocumentError> {
        Self::create().merge(update)
    }

    /// Merge a batch of updates into a single full-state update.
    fn merge_updates<I, B>(updates: I) -> Result<Vec<u8>, DocumentError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut doc = Self::create();
        for update in updates {
            doc.merge(update.as_ref())?;
        }
        Ok(doc.encode_full())
    }
}

/// Yrs-backed text document with a single root text named [`CONTENT_ROOT`].
pub struct YrsDocument {
    doc: Doc,
    content: TextRef,
}

impl YrsDocument {
    /// Insert `chunk` at `index` as a local edit.
    ///
    /// Returns the incremental v1 update produced by the edit, ready to be
    /// sent to the server.
    pub fn insert_text(&self, index: u32, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.content.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Append `chunk` at the end of the text as a local edit.
    pub fn append_text(&self, chunk: &str) -> Vec<u8> {
        let len = {
            let txn = self.doc.transact();
            self.content.len(&txn)
        };
        self.insert_text(len, chunk)
    }

    /// Incremental update containing everything `remote_state_vector` lacks.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::CorruptUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::create()
    }
}

impl std::fmt::Debug for YrsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsDocument")
            .field("content", &self.materialize())
            .finish()
    }
}

impl MergeableDocument for YrsDocument {
    fn create() -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_ROOT);
        Self { doc, content }
    }

    fn merge(&mut self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)
            .map_err(|e| DocumentError::CorruptUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::CorruptUpdate(e.to_string()))
    }

    fn encode_full(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn materialize(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    fn check_update(update: &[u8]) -> Result<(), DocumentError> {
        Update::decode_v1(update)
            .map(|_| ())
            .map_err(|e| DocumentError::CorruptUpdate(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_empty() {
        let doc = YrsDocument::create();
        assert_eq!(doc.materialize(), "");
    }

    #[test]
    fn test_encode_full_restores() {
        let doc = YrsDocument::create();
        doc.append_text("Some text");

        let full = doc.encode_full();
        assert!(!full.is_empty());

        let mut restored = YrsDocument::create();
        restored.merge(&full).unwrap();
        assert_eq!(restored.materialize(), "Some text");
    }

    #[test]
    fn test_state_vector_nonempty_after_edit() {
        let doc = YrsDocument::create();
        doc.append_text("test");
        assert!(!doc.encode_state_vector().is_empty());
    }

    #[test]
    fn test_incremental_updates_in_order() {
        let author = YrsDocument::create();
        let u1 = author.append_text("Hello");
        let u2 = author.append_text(" World");

        let mut replica = YrsDocument::create();
        replica.merge(&u1).unwrap();
        replica.merge(&u2).unwrap();
        assert_eq!(replica.materialize(), "Hello World");
    }

    #[test]
    fn test_out_of_order_and_duplicate_merge() {
        let author = YrsDocument::create();
        let u1 = author.append_text("Hello");
        let u2 = author.append_text(" World");

        let mut replica = YrsDocument::create();
        replica.merge(&u2).unwrap();
        replica.merge(&u1).unwrap();
        replica.merge(&u2).unwrap();
        replica.merge(&u1).unwrap();
        assert_eq!(replica.materialize(), "Hello World");
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let mut a = YrsDocument::create();
        let mut b = YrsDocument::create();

        let ua = a.append_text("A");
        let ub = b.append_text("B");

        a.merge(&ub).unwrap();
        b.merge(&ua).unwrap();

        let text_a = a.materialize();
        let text_b = b.materialize();
        assert_eq!(text_a, text_b);
        assert!(text_a.contains('A'));
        assert!(text_a.contains('B'));
    }

    #[test]
    fn test_full_state_exchange_converges() {
        let mut a = YrsDocument::create();
        let mut b = YrsDocument::create();
        a.append_text("left ");
        a.append_text("side");
        b.append_text("right");
        b.insert_text(0, ">> ");

        let full_a = a.encode_full();
        let full_b = b.encode_full();
        a.merge(&full_b).unwrap();
        b.merge(&full_a).unwrap();

        assert_eq!(a.materialize(), b.materialize());
    }

    #[test]
    fn test_corrupt_update_rejected() {
        let mut doc = YrsDocument::create();
        let err = doc.merge(&[0xFF, 0xFE, 0xFD]).unwrap_err();
        assert!(matches!(err, DocumentError::CorruptUpdate(_)));
        assert!(YrsDocument::check_update(&[0xFF, 0xFE, 0xFD]).is_err());
        assert_eq!(doc.materialize(), "");
    }

    #[test]
    fn test_check_update_accepts_real_update() {
        let doc = YrsDocument::create();
        let update = doc.append_text("ok");
        assert!(YrsDocument::check_update(&update).is_ok());
    }

    #[test]
    fn test_merge_updates_batch() {
        let author = YrsDocument::create();
        let u1 = author.append_text("Hello");
        let u2 = author.append_text(" World");

        let merged = YrsDocument::merge_updates([u1, u2]).unwrap();
        let mut restored = YrsDocument::create();
        restored.merge(&merged).unwrap();
        assert_eq!(restored.materialize(), "Hello World");
    }

    #[test]
    fn test_encode_diff_against_state_vector() {
        let author = YrsDocument::create();
        author.append_text("base");
        let mut replica = YrsDocument::create();
        replica.merge(&author.encode_full()).unwrap();

        author.append_text(" more");
        let diff = author.encode_diff(&replica.encode_state_vector()).unwrap();
        replica.merge(&diff).unwrap();
        assert_eq!(replica.materialize(), "base more");
    }
}
