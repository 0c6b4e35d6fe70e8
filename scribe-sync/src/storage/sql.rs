//! SQL update log and snapshot store (SQLite or PostgreSQL via `AnyPool`).
//!
//! Multiple gateway processes may share one database. The per-document
//! counter lives in `document_sequences` and is bumped with an upsert inside
//! the same transaction that inserts the update row, so the row lock on the
//! counter serializes concurrent appenders.

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Executor};
use uuid::Uuid;

use super::{
    now_millis, DocumentSnapshot, DocumentUpdate, SnapshotStore, StoreError, UpdateLog,
};

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Portable table definitions. BYTEA is native on PostgreSQL. SQLite gives
/// the column NUMERIC affinity, which leaves bound BLOB values untouched.
const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version BIGINT PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS document_updates (
        document_id TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        payload BYTEA NOT NULL,
        author_id TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        PRIMARY KEY (document_id, sequence)
    )",
    "CREATE TABLE IF NOT EXISTS document_snapshots (
        document_id TEXT NOT NULL,
        covered_sequence BIGINT NOT NULL,
        state BYTEA NOT NULL,
        state_vector BYTEA NOT NULL,
        created_at BIGINT NOT NULL,
        PRIMARY KEY (document_id, covered_sequence)
    )",
    // Survives pruning of document_updates, so sequences never restart
    "CREATE TABLE IF NOT EXISTS document_sequences (
        document_id TEXT PRIMARY KEY NOT NULL,
        last_sequence BIGINT NOT NULL
    )",
];

const SQLITE_PRAGMAS: &str = "PRAGMA busy_timeout = 5000;
     PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;";

/// Database backend kind for SQL dialect selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

impl DbKind {
    /// Infer the dialect from a connection URL.
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("sqlite:") {
            Some(DbKind::Sqlite)
        } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
            Some(DbKind::Postgres)
        } else {
            None
        }
    }
}

trait SqlResultExt<T> {
    fn sql_context(self, context: &str) -> Result<T, StoreError>;
}

impl<T> SqlResultExt<T> for Result<T, sqlx::Error> {
    fn sql_context(self, context: &str) -> Result<T, StoreError> {
        self.map_err(|e| StoreError::Database(format!("{context}: {e}")))
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Serialization(format!("{value} exceeds BIGINT")))
}

fn to_u64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Deserialization(format!("negative column value {value}")))
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// SQL-backed document store.
pub struct SqlStore {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlStore {
    /// Connect using a `sqlite:` or `postgres:` URL and initialize the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let kind = DbKind::from_url(url)
            .ok_or_else(|| StoreError::Database(format!("unsupported database url: {url}")))?;

        let pool = match kind {
            // One writer at a time; SQLite has no row locks to lean on.
            // Pragmas are per connection, so they run on every (re)connect.
            DbKind::Sqlite => AnyPoolOptions::new()
                .max_connections(1)
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        conn.execute(SQLITE_PRAGMAS).await?;
                        Ok(())
                    })
                })
                .connect(url)
                .await
                .sql_context("Failed to connect to SQLite")?,
            DbKind::Postgres => AnyPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .sql_context("Failed to connect to PostgreSQL")?,
        };

        let store = Self { pool, kind };
        store.initialize().await?;

        log::info!("Connected to {:?} document store", kind);
        Ok(store)
    }

    /// Open (creating if needed) a SQLite database file.
    pub async fn open_sqlite<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StoreError> {
        // mode=rwc: read-write-create
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().display());
        Self::connect(&url).await
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        for statement in CREATE_TABLES {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .sql_context("Failed to create table")?;
        }

        let (current,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .sql_context("Failed to read schema version")?;

        match current {
            None => {
                sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
                    .bind(SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await
                    .sql_context("Failed to record schema version")?;
            }
            Some(version) if version > SCHEMA_VERSION => {
                return Err(StoreError::Database(format!(
                    "database schema version {version} is newer than supported {SCHEMA_VERSION}"
                )));
            }
            Some(_) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl UpdateLog for SqlStore {
    async fn updates_since(
        &self,
        document_id: Uuid,
        sequence: u64,
    ) -> Result<Vec<DocumentUpdate>, StoreError> {
        // Clamp: nothing can exist above i64::MAX
        let since = i64::try_from(sequence).unwrap_or(i64::MAX);

        let rows: Vec<(i64, Vec<u8>, String, i64)> = sqlx::query_as(
            "SELECT sequence, payload, author_id, created_at
             FROM document_updates
             WHERE document_id = $1 AND sequence > $2
             ORDER BY sequence ASC",
        )
        .bind(document_id.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .sql_context("Failed to read updates")?;

        rows.into_iter()
            .map(|(sequence, payload, author_id, created_at)| {
                Ok(DocumentUpdate {
                    document_id,
                    sequence: to_u64(sequence)?,
                    payload,
                    author_id: parse_uuid(&author_id)?,
                    created_at: to_u64(created_at)?,
                })
            })
            .collect()
    }

    async fn append_update(
        &self,
        document_id: Uuid,
        payload: &[u8],
        author_id: Uuid,
    ) -> Result<DocumentUpdate, StoreError> {
        let created_at = now_millis();
        let doc_key = document_id.to_string();

        let mut tx = self
            .pool
            .begin()
            .await
            .sql_context("Failed to begin transaction")?;

        let (assigned,): (i64,) = sqlx::query_as(
            "INSERT INTO document_sequences (document_id, last_sequence)
             VALUES ($1, 1)
             ON CONFLICT (document_id)
             DO UPDATE SET last_sequence = document_sequences.last_sequence + 1
             RETURNING last_sequence",
        )
        .bind(&doc_key)
        .fetch_one(&mut *tx)
        .await
        .sql_context("Failed to assign sequence")?;

        let sequence = to_u64(assigned)?;

        let inserted = sqlx::query(
            "INSERT INTO document_updates (document_id, sequence, payload, author_id, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&doc_key)
        .bind(assigned)
        .bind(payload.to_vec())
        .bind(author_id.to_string())
        .bind(to_i64(created_at)?)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            if is_unique_violation(&e) {
                return Err(StoreError::SequenceConflict { document_id, sequence });
            }
            return Err(StoreError::Database(format!("Failed to insert update: {e}")));
        }

        tx.commit().await.sql_context("Failed to commit append")?;

        Ok(DocumentUpdate {
            document_id,
            sequence,
            payload: payload.to_vec(),
            author_id,
            created_at,
        })
    }

    async fn delete_updates_up_to(
        &self,
        document_id: Uuid,
        sequence: u64,
    ) -> Result<u64, StoreError> {
        let up_to = i64::try_from(sequence).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "DELETE FROM document_updates WHERE document_id = $1 AND sequence <= $2",
        )
        .bind(document_id.to_string())
        .bind(up_to)
        .execute(&self.pool)
        .await
        .sql_context("Failed to delete updates")?;
        Ok(result.rows_affected())
    }

    async fn head_sequence(&self, document_id: Uuid) -> Result<u64, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT last_sequence FROM document_sequences WHERE document_id = $1")
                .bind(document_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .sql_context("Failed to read sequence counter")?;
        match row {
            Some((last,)) => to_u64(last),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl SnapshotStore for SqlStore {
    async fn latest_snapshot(
        &self,
        document_id: Uuid,
    ) -> Result<Option<DocumentSnapshot>, StoreError> {
        let row: Option<(i64, Vec<u8>, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT covered_sequence, state, state_vector, created_at
             FROM document_snapshots
             WHERE document_id = $1
             ORDER BY covered_sequence DESC
             LIMIT 1",
        )
        .bind(document_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .sql_context("Failed to read snapshot")?;

        row.map(|(covered, state, state_vector, created_at)| {
            Ok(DocumentSnapshot {
                document_id,
                covered_sequence: to_u64(covered)?,
                state,
                state_vector,
                created_at: to_u64(created_at)?,
            })
        })
        .transpose()
    }

    async fn save_snapshot(
        &self,
        snapshot: DocumentSnapshot,
    ) -> Result<DocumentSnapshot, StoreError> {
        // A snapshot for the same covered sequence holds the same logical state
        sqlx::query(
            "INSERT INTO document_snapshots
                (document_id, covered_sequence, state, state_vector, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (document_id, covered_sequence) DO NOTHING",
        )
        .bind(snapshot.document_id.to_string())
        .bind(to_i64(snapshot.covered_sequence)?)
        .bind(snapshot.state.clone())
        .bind(snapshot.state_vector.clone())
        .bind(to_i64(snapshot.created_at)?)
        .execute(&self.pool)
        .await
        .sql_context("Failed to save snapshot")?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, SqlStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqlStore::open_sqlite(dir.path().join("scribe.db")).await.unwrap();
        (dir, store)
    }

    #[test]
    fn test_db_kind_from_url() {
        assert_eq!(DbKind::from_url("sqlite:x.db"), Some(DbKind::Sqlite));
        assert_eq!(DbKind::from_url("postgres://localhost/db"), Some(DbKind::Postgres));
        assert_eq!(DbKind::from_url("postgresql://localhost/db"), Some(DbKind::Postgres));
        assert_eq!(DbKind::from_url("/var/lib/scribe"), None);
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let (_dir, store) = open_temp().await;
        let doc = Uuid::new_v4();
        let author = Uuid::new_v4();

        let first = store.append_update(doc, b"one", author).await.unwrap();
        let second = store.append_update(doc, b"two", author).await.unwrap();
        assert_eq!((first.sequence, second.sequence), (1, 2));

        let all = store.updates_since(doc, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].payload, b"one");
        assert_eq!(all[1].author_id, author);
        assert_eq!(store.updates_since(doc, 1).await.unwrap()[0].sequence, 2);
        assert!(store.updates_since(doc, u64::MAX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_keeps_counter() {
        let (_dir, store) = open_temp().await;
        let doc = Uuid::new_v4();
        for _ in 0..4 {
            store.append_update(doc, b"x", Uuid::nil()).await.unwrap();
        }

        assert_eq!(store.delete_updates_up_to(doc, 4).await.unwrap(), 4);
        assert_eq!(store.delete_updates_up_to(doc, 4).await.unwrap(), 0);
        assert_eq!(store.head_sequence(doc).await.unwrap(), 4);

        let next = store.append_update(doc, b"y", Uuid::nil()).await.unwrap();
        assert_eq!(next.sequence, 5);
    }

    #[tokio::test]
    async fn test_latest_snapshot_and_duplicate_save() {
        let (_dir, store) = open_temp().await;
        let doc = Uuid::new_v4();
        assert!(store.latest_snapshot(doc).await.unwrap().is_none());

        store.save_snapshot(DocumentSnapshot::new(doc, 10, b"ten".to_vec(), vec![1])).await.unwrap();
        store.save_snapshot(DocumentSnapshot::new(doc, 30, b"thirty".to_vec(), vec![3])).await.unwrap();
        store.save_snapshot(DocumentSnapshot::new(doc, 20, b"twenty".to_vec(), vec![2])).await.unwrap();
        store.save_snapshot(DocumentSnapshot::new(doc, 30, b"again".to_vec(), vec![9])).await.unwrap();

        let latest = store.latest_snapshot(doc).await.unwrap().unwrap();
        assert_eq!(latest.covered_sequence, 30);
        assert_eq!(latest.state, b"thirty");
        assert_eq!(latest.state_vector, vec![3]);
    }

    #[tokio::test]
    async fn test_schema_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scribe.db");
        let doc = Uuid::new_v4();
        {
            let store = SqlStore::open_sqlite(&path).await.unwrap();
            store.append_update(doc, b"a", Uuid::nil()).await.unwrap();
            store.pool().close().await;
        }
        let store = SqlStore::open_sqlite(&path).await.unwrap();
        assert_eq!(store.kind(), DbKind::Sqlite);
        assert_eq!(store.append_update(doc, b"b", Uuid::nil()).await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_sqlite_pragmas_survive_reconnect() {
        let (_dir, store) = open_temp().await;

        // Detaching removes the only pooled connection; the next query reconnects
        let conn = store.pool().acquire().await.unwrap();
        drop(conn.detach());

        let (timeout,): (i64,) = sqlx::query_as("PRAGMA busy_timeout")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(timeout, 5000);
    }
}
