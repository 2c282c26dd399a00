//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: one bincode-encoded record per document, keyed by the
//!   16-byte document id, with the content payload LZ4 compressed
//!
//! RocksDB has no native compare-and-set, so the read-modify-write of
//! [`DocumentStore::compare_and_set`] runs under a per-document lock. Locks
//! are striped by document id: writes to different documents only contend
//! when their ids share a stripe. Reads never take a lock.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{DocumentRecord, DocumentStore, StoreError};

const CF_DOCUMENTS: &str = "documents";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS];

/// Number of write lock stripes.
const LOCK_STRIPES: usize = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every accepted write (default: true; version bumps must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write per document so CAS is atomic.
    write_locks: Vec<Mutex<()>>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
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
            write_locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Content is already LZ4 framed; don't compress twice.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(CF_DOCUMENTS).ok_or_else(|| {
            StoreError::Database(format!("Column family '{CF_DOCUMENTS}' not found"))
        })
    }

    fn encode_record(record: &DocumentRecord) -> Result<Vec<u8>, StoreError> {
        let mut stored = record.clone();
        stored.content = lz4_flex::compress_prepend_size(&record.content);
        bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode_record(bytes: &[u8]) -> Result<DocumentRecord, StoreError> {
        let (mut record, _): (DocumentRecord, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        record.content = lz4_flex::decompress_size_prepended(&record.content)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        Ok(record)
    }

    fn put(&self, record: &DocumentRecord) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, record.id.as_bytes(), Self::encode_record(record)?, &write_opts)?;
        Ok(())
    }

    fn stripe(id: Uuid) -> usize {
        (id.as_u128() % LOCK_STRIPES as u128) as usize
    }

    fn lock(&self, id: Uuid) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_locks[Self::stripe(id)]
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".into()))
    }
}

impl DocumentStore for RocksStore {
    fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert(&self, record: DocumentRecord) -> Result<(), StoreError> {
        let _guard = self.lock(record.id)?;
        if self.get(record.id)?.is_some() {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.put(&record)
    }

    fn compare_and_set(
        &self,
        expected: &DocumentRecord,
        record: DocumentRecord,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock(record.id)?;
        let stored = self.get(record.id)?.ok_or(StoreError::NotFound(record.id))?;
        if stored != *expected {
            return Ok(false);
        }
        self.put(&record)?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf()?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("Invalid UUID key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }
}
