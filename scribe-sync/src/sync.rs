//! Document load, persist and compaction.
//!
//! ```text
//!            persist_update                         load_document_state
//!  client ──► check ──► append (seq) ──┐     snapshot ──► merge ──► updates > covered ──► merge
//!                                      │
//!                    seq % interval == 0
//!                                      ▼
//!                 compact: rebuild ──► save snapshot ──► prune ≤ covered
//! ```
//!
//! Pruning only ever follows a committed snapshot, so a reader that sees the
//! same latest snapshot before and after reading the update tail has seen
//! every update it needs.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::document::{MergeableDocument, YrsDocument};
use crate::error::{CollabError, Result};
use crate::storage::{DocumentSnapshot, DocumentStore, DocumentUpdate, StoreError};

/// Sync service configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Compact when an assigned sequence is a multiple of this (default: 50)
    pub compaction_interval: u64,
    /// Snapshot/update re-reads before giving up under compaction churn
    pub max_read_attempts: u32,
    /// Extra append attempts on transient storage errors
    pub storage_retries: u32,
    /// Delay before the first retry; doubles each attempt
    pub retry_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            compaction_interval: 50,
            max_read_attempts: 5,
            storage_retries: 3,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            compaction_interval: 50,
            max_read_attempts: 5,
            storage_retries: 1,
            retry_backoff: Duration::from_millis(1),
        }
    }
}

/// Rebuilt replica plus the highest sequence merged into it.
struct Rebuilt<D> {
    doc: D,
    head: u64,
    base: Option<DocumentSnapshot>,
}

/// Persist, load and compact documents over a shared [`DocumentStore`].
pub struct SyncService<D: MergeableDocument = YrsDocument> {
    store: Arc<dyn DocumentStore>,
    config: SyncConfig,
    _doc: PhantomData<fn() -> D>,
}

impl<D: MergeableDocument> Clone for SyncService<D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            _doc: PhantomData,
        }
    }
}

impl<D: MergeableDocument> SyncService<D> {
    pub fn new(store: Arc<dyn DocumentStore>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            _doc: PhantomData,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Current state: latest snapshot plus every later update.
    pub async fn load_document_state(&self, document_id: Uuid) -> Result<D> {
        Ok(self.rebuild(document_id).await?.doc)
    }

    /// Materialized text of the current state.
    pub async fn materialize(&self, document_id: Uuid) -> Result<String> {
        Ok(self.load_document_state(document_id).await?.materialize())
    }

    /// Validate and durably append one client update.
    ///
    /// Compacts inline when the assigned sequence lands on the interval. A
    /// failed compaction is logged; the update is already durable.
    pub async fn persist_update(
        &self,
        document_id: Uuid,
        author_id: Uuid,
        payload: &[u8],
    ) -> Result<DocumentUpdate> {
        D::check_update(payload)?;

        let update = self.append_with_retry(document_id, author_id, payload).await?;
        log::trace!(
            "Persisted update {} for {document_id} ({} bytes)",
            update.sequence,
            payload.len()
        );

        let interval = self.config.compaction_interval;
        if interval > 0 && update.sequence % interval == 0 {
            if let Err(e) = self.compact(document_id).await {
                log::error!("Compaction of {document_id} at {} failed: {e}", update.sequence);
            }
        }

        Ok(update)
    }

    /// Fold the log into a snapshot, then prune what it covers.
    pub async fn compact(&self, document_id: Uuid) -> Result<DocumentSnapshot> {
        let rebuilt = self.rebuild(document_id).await?;

        if let Some(base) = rebuilt.base {
            if base.covered_sequence >= rebuilt.head {
                log::debug!(
                    "Snapshot for {document_id} already covers {}",
                    base.covered_sequence
                );
                return Ok(base);
            }
        }

        let snapshot = DocumentSnapshot::new(
            document_id,
            rebuilt.head,
            rebuilt.doc.encode_full(),
            rebuilt.doc.encode_state_vector(),
        );
        let snapshot = self.store.save_snapshot(snapshot).await?;

        let pruned = self
            .store
            .delete_updates_up_to(document_id, snapshot.covered_sequence)
            .await?;
        log::info!(
            "Compacted {document_id}: snapshot covers {}, pruned {pruned} updates",
            snapshot.covered_sequence
        );
        Ok(snapshot)
    }

    async fn append_with_retry(
        &self,
        document_id: Uuid,
        author_id: Uuid,
        payload: &[u8],
    ) -> Result<DocumentUpdate> {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.store.append_update(document_id, payload, author_id).await {
                Ok(update) => return Ok(update),
                Err(e) => {
                    let err = CollabError::from(e);
                    if !err.is_retryable() || attempt >= self.config.storage_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    log::warn!(
                        "Append for {document_id} failed ({err}), retry {attempt}/{}",
                        self.config.storage_retries
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// Consistent read of snapshot + tail, retried while compaction moves
    /// the snapshot underneath us.
    async fn rebuild(&self, document_id: Uuid) -> Result<Rebuilt<D>> {
        let attempts = self.config.max_read_attempts.max(1);
        let mut last_seen = None;

        for attempt in 1..=attempts {
            let base = self.store.latest_snapshot(document_id).await?;
            let covered = base.as_ref().map_or(0, |s| s.covered_sequence);
            let tail = self.store.updates_since(document_id, covered).await?;
            let check = self.store.latest_snapshot(document_id).await?;
            let check_covered = check.as_ref().map_or(0, |s| s.covered_sequence);

            if check_covered != covered {
                log::debug!(
                    "Snapshot for {document_id} moved {covered} → {check_covered} during read \
                     (attempt {attempt}/{attempts})"
                );
                last_seen = Some(check_covered);
                continue;
            }

            let mut doc = D::create();
            if let Some(snapshot) = base.as_ref() {
                doc.merge(&snapshot.state)?;
            }

            let mut head = covered;
            for update in &tail {
                match doc.merge(&update.payload) {
                    Ok(()) => head = head.max(update.sequence),
                    Err(e) => log::warn!(
                        "Skipping stored update {} of {document_id}: {e}",
                        update.sequence
                    ),
                }
            }

            return Ok(Rebuilt { doc, head, base });
        }

        Err(StoreError::Database(format!(
            "snapshot for {document_id} kept moving (last seen {}) after {attempts} reads",
            last_seen.unwrap_or_default()
        ))
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RocksStore, SnapshotStore, StoreConfig, UpdateLog};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` appends with `error`, then behaves normally.
    struct FailingStore {
        inner: RocksStore,
        error: StoreError,
        failures: u32,
        attempts: AtomicU32,
    }

    impl FailingStore {
        fn new(dir: &tempfile::TempDir, error: StoreError, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                inner: RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap(),
                error,
                failures,
                attempts: AtomicU32::new(0),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl UpdateLog for FailingStore {
        async fn updates_since(
            &self,
            document_id: Uuid,
            sequence: u64,
        ) -> std::result::Result<Vec<DocumentUpdate>, StoreError> {
            self.inner.updates_since(document_id, sequence).await
        }

        async fn append_update(
            &self,
            document_id: Uuid,
            payload: &[u8],
            author_id: Uuid,
        ) -> std::result::Result<DocumentUpdate, StoreError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(self.error.clone());
            }
            self.inner.append_update(document_id, payload, author_id).await
        }

        async fn delete_updates_up_to(
            &self,
            document_id: Uuid,
            sequence: u64,
        ) -> std::result::Result<u64, StoreError> {
            self.inner.delete_updates_up_to(document_id, sequence).await
        }

        async fn head_sequence(&self, document_id: Uuid) -> std::result::Result<u64, StoreError> {
            self.inner.head_sequence(document_id).await
        }
    }

    #[async_trait::async_trait]
    impl SnapshotStore for FailingStore {
        async fn latest_snapshot(
            &self,
            document_id: Uuid,
        ) -> std::result::Result<Option<DocumentSnapshot>, StoreError> {
            self.inner.latest_snapshot(document_id).await
        }

        async fn save_snapshot(
            &self,
            snapshot: DocumentSnapshot,
        ) -> std::result::Result<DocumentSnapshot, StoreError> {
            self.inner.save_snapshot(snapshot).await
        }
    }

    fn retrying_service(store: Arc<FailingStore>, retries: u32) -> SyncService {
        SyncService::new(
            store,
            SyncConfig {
                storage_retries: retries,
                ..SyncConfig::for_testing()
            },
        )
    }

    fn service(dir: &tempfile::TempDir, interval: u64) -> SyncService {
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        SyncService::new(
            Arc::new(store),
            SyncConfig {
                compaction_interval: interval,
                ..SyncConfig::for_testing()
            },
        )
    }

    #[tokio::test]
    async fn test_load_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let sync = service(&dir, 50);
        assert_eq!(sync.materialize(Uuid::new_v4()).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_hello_world_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let sync = service(&dir, 2);
        let doc = Uuid::new_v4();
        let author = Uuid::new_v4();

        let client = YrsDocument::create();
        let u1 = client.append_text("Hello");
        let u2 = client.append_text(" World");

        assert_eq!(sync.persist_update(doc, author, &u1).await.unwrap().sequence, 1);
        assert_eq!(sync.persist_update(doc, author, &u2).await.unwrap().sequence, 2);

        // Interval 2: compaction ran inline at sequence 2
        let snap = sync.store().latest_snapshot(doc).await.unwrap().unwrap();
        assert_eq!(snap.covered_sequence, 2);
        assert!(sync.store().updates_since(doc, 0).await.unwrap().is_empty());
        assert_eq!(sync.materialize(doc).await.unwrap(), "Hello World");
    }

    #[tokio::test]
    async fn test_corrupt_update_never_reaches_log() {
        let dir = tempfile::tempdir().unwrap();
        let sync = service(&dir, 50);
        let doc = Uuid::new_v4();

        let err = sync
            .persist_update(doc, Uuid::nil(), &[0xFF, 0xFE, 0xFD])
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::CorruptUpdate(_)));
        assert_eq!(sync.store().head_sequence(doc).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compact_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sync = service(&dir, 0);
        let doc = Uuid::new_v4();
        let client = YrsDocument::create();
        sync.persist_update(doc, Uuid::nil(), &client.append_text("abc")).await.unwrap();

        let first = sync.compact(doc).await.unwrap();
        let second = sync.compact(doc).await.unwrap();
        assert_eq!(first.covered_sequence, 1);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_updates_after_compaction_survive() {
        let dir = tempfile::tempdir().unwrap();
        let sync = service(&dir, 0);
        let doc = Uuid::new_v4();
        let client = YrsDocument::create();

        sync.persist_update(doc, Uuid::nil(), &client.append_text("one ")).await.unwrap();
        sync.compact(doc).await.unwrap();
        let later = sync
            .persist_update(doc, Uuid::nil(), &client.append_text("two"))
            .await
            .unwrap();
        assert_eq!(later.sequence, 2);

        assert_eq!(sync.store().updates_since(doc, 1).await.unwrap().len(), 1);
        assert_eq!(sync.materialize(doc).await.unwrap(), "one two");
    }

    #[tokio::test]
    async fn test_compact_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let sync = service(&dir, 0);
        let doc = Uuid::new_v4();

        let snap = sync.compact(doc).await.unwrap();
        assert_eq!(snap.covered_sequence, 0);
        let mut restored = YrsDocument::create();
        restored.merge(&snap.state).unwrap();
        assert_eq!(restored.materialize(), "");
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.compaction_interval, 50);
        assert_eq!(config.storage_retries, 3);
    }

    #[tokio::test]
    async fn test_transient_append_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailingStore::new(&dir, StoreError::Database("connection reset".into()), 1);
        let sync = retrying_service(store.clone(), 1);
        let doc = Uuid::new_v4();

        let update = sync
            .persist_update(doc, Uuid::nil(), &YrsDocument::create().append_text("x"))
            .await
            .unwrap();
        assert_eq!(update.sequence, 1);
        assert_eq!(store.attempts(), 2);
    }

    #[tokio::test]
    async fn test_persistent_append_failure_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailingStore::new(&dir, StoreError::Database("disk full".into()), u32::MAX);
        let sync = retrying_service(store.clone(), 3);
        let doc = Uuid::new_v4();

        let err = sync
            .persist_update(doc, Uuid::nil(), &YrsDocument::create().append_text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::Storage(StoreError::Database(_))));
        assert_eq!(store.attempts(), 4);
        assert_eq!(sync.store().head_sequence(doc).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sequence_conflict_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        let conflict = StoreError::SequenceConflict {
            document_id: doc,
            sequence: 1,
        };
        let store = FailingStore::new(&dir, conflict, u32::MAX);
        let sync = retrying_service(store.clone(), 3);

        let err = sync
            .persist_update(doc, Uuid::nil(), &YrsDocument::create().append_text("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::SequenceConflict { sequence: 1, .. }));
        assert_eq!(store.attempts(), 1);
    }
}
