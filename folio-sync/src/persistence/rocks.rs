//! RocksDB-backed persistence adapter.
//!
//! Column families:
//! - `documents` — Persisted records (bincode, LZ4 compressed), keyed by doc UUID
//! - `metadata`  — Per-document metadata (bincode: sizes, counts, timestamps)
//!
//! On open, every stored record is read back once; the synced signal fires
//! when that pass completes.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::{DocLocks, LocalPersistence, PersistedRecord, PersistenceError, SyncedNotifier, SyncedSignal};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

/// Metadata stored next to each record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub doc_id: Uuid,
    /// Uncompressed record size in bytes
    pub record_size: u64,
    /// Compressed record size in bytes
    pub compressed_size: u64,
    /// Number of applied update IDs
    pub applied_count: u64,
    /// Number of saves
    pub save_count: u64,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl RecordMetadata {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            record_size: 0,
            compressed_size: 0,
            applied_count: 0,
            save_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

/// Durable persistence on RocksDB.
pub struct RocksPersistence {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    locks: DocLocks,
    notifier: SyncedNotifier,
}

impl RocksPersistence {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self {
            db,
            config,
            locks: DocLocks::default(),
            notifier: SyncedNotifier::new(),
        };
        let (ok, bad) = store.catch_up()?;
        log::info!(
            "Opened persistence at {} ({ok} documents, {bad} unreadable)",
            store.config.path.display()
        );
        store.notifier.fire();
        Ok(store)
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Records are already LZ4 compressed
            CF_DOCUMENTS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Read every stored record once; returns (readable, unreadable).
    fn catch_up(&self) -> Result<(usize, usize), PersistenceError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let (mut ok, mut bad) = (0, 0);
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            match Self::decode_record(&value) {
                Ok(_) => ok += 1,
                Err(e) => {
                    log::warn!("Unreadable record {:02x?}: {e}", &key[..key.len().min(16)]);
                    bad += 1;
                }
            }
        }
        Ok((ok, bad))
    }

    fn encode_record(record: &PersistedRecord) -> Result<(Vec<u8>, usize), PersistenceError> {
        let raw = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok((lz4_flex::compress_prepend_size(&raw), raw.len()))
    }

    fn decode_record(bytes: &[u8]) -> Result<PersistedRecord, PersistenceError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| PersistenceError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| PersistenceError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn read_record(&self, doc_id: Uuid) -> Result<Option<PersistedRecord>, PersistenceError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Record and metadata in one atomic batch.
    fn write_record(&self, doc_id: Uuid, record: &PersistedRecord) -> Result<(), PersistenceError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let (compressed, raw_len) = Self::encode_record(record)?;
        let mut meta = self
            .load_metadata(doc_id)
            .unwrap_or_else(|_| RecordMetadata::new(doc_id));
        meta.record_size = raw_len as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.applied_count = record.applied.len() as u64;
        meta.save_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, doc_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    pub fn load_metadata(&self, doc_id: Uuid) -> Result<RecordMetadata, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => RecordMetadata::decode(&bytes),
            None => Err(PersistenceError::NotFound(doc_id)),
        }
    }

    /// All document IDs with a stored record.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut doc_ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() == 16 {
                let bytes: [u8; 16] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| PersistenceError::Deserialization("Invalid UUID key".into()))?;
                doc_ids.push(Uuid::from_bytes(bytes));
            }
        }
        Ok(doc_ids)
    }

    pub async fn delete_document(&self, doc_id: Uuid) -> Result<(), PersistenceError> {
        let _guard = self.locks.acquire(doc_id).await;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_DOCUMENTS)?, doc_id.as_bytes());
        batch.delete_cf(&self.cf(CF_METADATA)?, doc_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl LocalPersistence for RocksPersistence {
    async fn load(&self, doc_id: Uuid) -> Result<Option<PersistedRecord>, PersistenceError> {
        let _guard = self.locks.acquire(doc_id).await;
        self.read_record(doc_id)
    }

    async fn save(&self, doc_id: Uuid, record: &PersistedRecord) -> Result<(), PersistenceError> {
        let _guard = self.locks.acquire(doc_id).await;
        let merged = match self.read_record(doc_id)? {
            Some(stored) => stored.merged_with(record)?,
            None => record.clone(),
        };
        self.write_record(doc_id, &merged)
    }

    fn synced(&self) -> SyncedSignal {
        self.notifier.signal()
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
