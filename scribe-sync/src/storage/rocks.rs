//! RocksDB-backed update log and snapshot store.
//!
//! Column families:
//! - `updates`    `<doc_id:16><sequence:8 BE>` → bincode record, LZ4 payload
//! - `snapshots`  `<doc_id:16><covered:8 BE>`  → bincode record, LZ4 state
//! - `sequences`  `<doc_id:16>`                → last assigned sequence (8 BE)
//!
//! RocksDB holds an exclusive lock on its directory, so the owning process is
//! the only writer. Appends for one document are serialized by a striped lock
//! and commit the counter and the update in a single `WriteBatch`.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    now_millis, DocumentSnapshot, DocumentUpdate, SnapshotStore, StoreError, UpdateLog,
};

const CF_UPDATES: &str = "updates";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_SEQUENCES: &str = "sequences";

const COLUMN_FAMILIES: &[&str] = &[CF_UPDATES, CF_SNAPSHOTS, CF_SEQUENCES];

/// Number of append lock stripes. Documents hash onto a stripe.
const LOCK_STRIPES: usize = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append and snapshot (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredUpdate {
    author_id: Uuid,
    created_at: u64,
    /// LZ4, size-prepended
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredSnapshot {
    created_at: u64,
    /// LZ4, size-prepended
    state: Vec<u8>,
    state_vector: Vec<u8>,
}

fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_record<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

/// RocksDB-backed document store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode: concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    append_locks: [Mutex<()>; LOCK_STRIPES],
}

impl RocksStore {
    /// Open the store at the configured path, creating column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            append_locks: std::array::from_fn(|_| Mutex::new(())),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Many small writes, range-scanned by doc_id
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None); // values already LZ4
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_SEQUENCES => {
                // Tiny values, point lookups on every append
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn append_lock(&self, document_id: &Uuid) -> &Mutex<()> {
        &self.append_locks[(document_id.as_u128() % LOCK_STRIPES as u128) as usize]
    }

    fn read_head(&self, document_id: Uuid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_SEQUENCES)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => decode_sequence(&bytes),
            None => Ok(0),
        }
    }

    fn append_locked(
        &self,
        document_id: Uuid,
        payload: &[u8],
        author_id: Uuid,
    ) -> Result<DocumentUpdate, StoreError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_sequences = self.cf(CF_SEQUENCES)?;

        let _guard = self
            .append_lock(&document_id)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let sequence = self.read_head(document_id)? + 1;
        let key = Self::sequenced_key(document_id, sequence);
        if self.db.get_pinned_cf(cf_updates, &key)?.is_some() {
            return Err(StoreError::SequenceConflict { document_id, sequence });
        }

        let created_at = now_millis();
        let record = StoredUpdate {
            author_id,
            created_at,
            payload: lz4_flex::compress_prepend_size(payload),
        };

        // Counter and row land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_sequences, document_id.as_bytes(), sequence.to_be_bytes());
        batch.put_cf(cf_updates, &key, encode_record(&record)?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(DocumentUpdate {
            document_id,
            sequence,
            payload: payload.to_vec(),
            author_id,
            created_at,
        })
    }

    fn scan_updates(&self, document_id: Uuid, since: u64) -> Result<Vec<DocumentUpdate>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let Some(first) = since.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start_key = Self::sequenced_key(document_id, first);

        let mut updates = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            let Some(sequence) = Self::key_sequence(document_id, &key) else {
                break;
            };
            let record: StoredUpdate = decode_record(&value)?;
            updates.push(DocumentUpdate {
                document_id,
                sequence,
                payload: decompress(&record.payload)?,
                author_id: record.author_id,
                created_at: record.created_at,
            });
        }

        Ok(updates)
    }

    fn prune_updates(&self, document_id: Uuid, up_to: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start_key = Self::sequenced_key(document_id, 0);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            match Self::key_sequence(document_id, &key) {
                Some(sequence) if sequence <= up_to => {
                    batch.delete_cf(cf, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    fn find_latest_snapshot(&self, document_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let end_key = Self::sequenced_key(document_id, u64::MAX);

        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&end_key, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                let Some(covered_sequence) = Self::key_sequence(document_id, &key) else {
                    return Ok(None);
                };
                let record: StoredSnapshot = decode_record(&value)?;
                Ok(Some(DocumentSnapshot {
                    document_id,
                    covered_sequence,
                    state: decompress(&record.state)?,
                    state_vector: record.state_vector,
                    created_at: record.created_at,
                }))
            }
            None => Ok(None),
        }
    }

    fn put_snapshot(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let record = StoredSnapshot {
            created_at: snapshot.created_at,
            state: lz4_flex::compress_prepend_size(&snapshot.state),
            state_vector: snapshot.state_vector.clone(),
        };
        let key = Self::sequenced_key(snapshot.document_id, snapshot.covered_sequence);
        self.db.put_cf_opt(cf, key, encode_record(&record)?, &self.write_options())?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn sequenced_key(document_id: Uuid, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(document_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Sequence part of a key, or `None` if the key belongs to another document.
    fn key_sequence(document_id: Uuid, key: &[u8]) -> Option<u64> {
        if key.len() != 24 || &key[..16] != document_id.as_bytes() {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..24]);
        Some(u64::from_be_bytes(buf))
    }
}

fn decode_sequence(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization("sequence counter is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(buf))
}

#[async_trait]
impl UpdateLog for RocksStore {
    async fn updates_since(
        &self,
        document_id: Uuid,
        sequence: u64,
    ) -> Result<Vec<DocumentUpdate>, StoreError> {
        self.scan_updates(document_id, sequence)
    }

    async fn append_update(
        &self,
        document_id: Uuid,
        payload: &[u8],
        author_id: Uuid,
    ) -> Result<DocumentUpdate, StoreError> {
        self.append_locked(document_id, payload, author_id)
    }

    async fn delete_updates_up_to(
        &self,
        document_id: Uuid,
        sequence: u64,
    ) -> Result<u64, StoreError> {
        self.prune_updates(document_id, sequence)
    }

    async fn head_sequence(&self, document_id: Uuid) -> Result<u64, StoreError> {
        self.read_head(document_id)
    }
}

#[async_trait]
impl SnapshotStore for RocksStore {
    async fn latest_snapshot(
        &self,
        document_id: Uuid,
    ) -> Result<Option<DocumentSnapshot>, StoreError> {
        self.find_latest_snapshot(document_id)
    }

    async fn save_snapshot(
        &self,
        snapshot: DocumentSnapshot,
    ) -> Result<DocumentSnapshot, StoreError> {
        self.put_snapshot(&snapshot)?;
        Ok(snapshot)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
