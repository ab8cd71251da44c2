//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`     — latest full replica state per document (LZ4 compressed)
//! - `metadata`      — per-document bookkeeping (sizes, save count, timestamps)
//! - `versions`      — version rows keyed by `<doc prefix><seq:8 BE>`
//! - `version_index` — version id → key in `versions`
//!
//! The doc prefix is the id's byte length (2 bytes BE) followed by its bytes,
//! so one document's versions form a contiguous, insertion-ordered range and
//! no id is a prefix of another's range.
//!
//! RocksDB calls are blocking; the [`DocumentStore`] impl runs each one on
//! `spawn_blocking`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{DocId, DocumentStore, SnapshotMeta, StoreError, VersionId, VersionInfo, VersionRecord};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_VERSIONS: &str = "versions";
const CF_VERSION_INDEX: &str = "version_index";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_VERSIONS, CF_VERSION_INDEX];

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
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("easel_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided (usually temporary) directory.
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

/// Per-document bookkeeping stored next to the state blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: DocId,
    /// Uncompressed state size in bytes
    pub state_size: u64,
    pub compressed_size: u64,
    /// Number of successful saves
    pub save_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentMetadata {
    fn new(doc_id: DocId) -> Self {
        let now = Utc::now();
        Self {
            doc_id,
            state_size: 0,
            compressed_size: 0,
            save_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Stored form of a version row.
#[derive(Debug, Serialize, Deserialize)]
struct VersionRow {
    id: Uuid,
    doc_id: DocId,
    meta: SnapshotMeta,
    created_at: DateTime<Utc>,
    state_size: u64,
    /// LZ4, size-prepended
    state: Vec<u8>,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

/// RocksDB-backed [`DocumentStore`]. Cheap to clone.
#[derive(Clone)]
pub struct RocksStore {
    inner: Arc<RocksInner>,
}

struct RocksInner {
    /// Single-threaded column family mode, concurrency comes from tokio
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes sequence assignment in `append_version`.
    append_lock: Mutex<()>,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            inner: Arc::new(RocksInner { db, config, append_lock: Mutex::new(()) }),
        })
    }

    pub fn metadata(&self, doc_id: &DocId) -> Result<Option<DocumentMetadata>, StoreError> {
        self.inner.load_metadata(doc_id)
    }

    /// Ids of every document with saved state.
    pub fn list_documents(&self) -> Result<Vec<DocId>, StoreError> {
        let cf = self.inner.cf(CF_METADATA)?;
        let mut docs = Vec::new();
        for item in self.inner.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let meta: DocumentMetadata = decode(&value)?;
            docs.push(meta.doc_id);
        }
        Ok(docs)
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

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
        CF_DOCUMENTS => {
            // Blobs are already LZ4 compressed
            opts.set_compression_type(DBCompressionType::None);
            opts.set_max_write_buffer_number(2);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        CF_METADATA | CF_VERSION_INDEX => {
            opts.set_compression_type(DBCompressionType::Lz4);
            opts.optimize_for_point_lookup(config.block_cache_size as u64);
        }
        CF_VERSIONS => {
            // Range-scanned per document
            opts.set_compression_type(DBCompressionType::None);
            opts.set_max_write_buffer_number(2);
        }
        _ => {}
    }
    opts
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    // ─── Document state ───────────────────────────────────────────────

    fn load_state(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_str().as_bytes())? {
            Some(compressed) => Ok(Some(decompress(&compressed)?)),
            None => Ok(None),
        }
    }

    fn save_state(&self, doc_id: &DocId, state: &[u8]) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let compressed = lz4_flex::compress_prepend_size(state);

        let mut meta = self
            .load_metadata(doc_id)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_id.clone()));
        meta.state_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.save_count += 1;
        meta.updated_at = Utc::now();

        let key = doc_id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, key, &compressed);
        batch.put_cf(cf_meta, key, encode(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    fn load_metadata(&self, doc_id: &DocId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Versions ─────────────────────────────────────────────────────

    fn append_version(&self, record: &VersionRecord) -> Result<VersionInfo, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| StoreError::Database("version append lock poisoned".into()))?;

        let prefix = doc_prefix(&record.doc_id);
        let seq = self.next_seq(&prefix)?;
        let key = version_key(&prefix, seq);
        let row = VersionRow {
            id: record.id,
            doc_id: record.doc_id.clone(),
            meta: record.meta.clone(),
            created_at: record.created_at,
            state_size: record.state.len() as u64,
            state: lz4_flex::compress_prepend_size(&record.state),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_versions, &key, encode(&row)?);
        batch.put_cf(cf_index, record.id.as_bytes(), &key);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(row.info(seq))
    }

    /// Next free sequence inside one document's range.
    fn next_seq(&self, prefix: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let end = version_key(prefix, u64::MAX);
        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(Ok((key, _))) => Ok(parse_seq(prefix, &key).map_or(0, |seq| seq + 1)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(0),
        }
    }

    fn list_versions(&self, doc_id: &DocId) -> Result<Vec<VersionInfo>, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let prefix = doc_prefix(doc_id);
        let mut versions = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, value) = item?;
            let Some(seq) = parse_seq(&prefix, &key) else { break };
            let row: VersionRow = decode(&value)?;
            versions.push(row.info(seq));
        }
        Ok(versions)
    }

    fn get_version(&self, id: VersionId) -> Result<Option<VersionRecord>, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;

        let Some(key) = self.db.get_cf(cf_index, id.as_bytes())? else {
            return Ok(None);
        };
        let Some(value) = self.db.get_cf(cf_versions, &key)? else {
            log::warn!("Version index points at missing row for {id}");
            return Ok(None);
        };
        let row: VersionRow = decode(&value)?;
        Ok(Some(VersionRecord {
            id: row.id,
            doc_id: row.doc_id,
            meta: row.meta,
            created_at: row.created_at,
            state: decompress(&row.state)?,
        }))
    }

    fn delete_versions(&self, doc_id: &DocId, ids: &[VersionId]) -> Result<usize, StoreError> {
        let cf_versions = self.cf(CF_VERSIONS)?;
        let cf_index = self.cf(CF_VERSION_INDEX)?;
        let prefix = doc_prefix(doc_id);

        let mut batch = WriteBatch::default();
        let mut count = 0;
        for id in ids {
            match self.db.get_cf(cf_index, id.as_bytes())? {
                Some(key) if parse_seq(&prefix, &key).is_some() => {
                    batch.delete_cf(cf_versions, &key);
                    batch.delete_cf(cf_index, id.as_bytes());
                    count += 1;
                }
                _ => {}
            }
        }
        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }
}

impl VersionRow {
    fn info(&self, seq: u64) -> VersionInfo {
        VersionInfo {
            id: self.id,
            doc_id: self.doc_id.clone(),
            meta: self.meta.clone(),
            created_at: self.created_at,
            seq,
            size: self.state_size,
        }
    }
}

fn doc_prefix(doc_id: &DocId) -> Vec<u8> {
    let bytes = doc_id.as_str().as_bytes();
    let mut prefix = Vec::with_capacity(2 + bytes.len());
    // DocId::parse caps ids well below u16::MAX
    prefix.extend_from_slice(&(bytes.len().min(u16::MAX as usize) as u16).to_be_bytes());
    prefix.extend_from_slice(bytes);
    prefix
}

fn version_key(prefix: &[u8], seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Sequence of `key` if it belongs to the range of `prefix`.
fn parse_seq(prefix: &[u8], key: &[u8]) -> Option<u64> {
    if key.len() != prefix.len() + 8 || !key.starts_with(prefix) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[prefix.len()..]);
    Some(u64::from_be_bytes(buf))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn load_state(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, StoreError> {
        let doc_id = doc_id.clone();
        self.blocking(move |inner| inner.load_state(&doc_id)).await
    }

    async fn save_state(&self, doc_id: &DocId, state: &[u8]) -> Result<(), StoreError> {
        let doc_id = doc_id.clone();
        let state = state.to_vec();
        self.blocking(move |inner| inner.save_state(&doc_id, &state)).await
    }

    async fn append_version(&self, record: &VersionRecord) -> Result<VersionInfo, StoreError> {
        let record = record.clone();
        self.blocking(move |inner| inner.append_version(&record)).await
    }

    async fn list_versions(&self, doc_id: &DocId) -> Result<Vec<VersionInfo>, StoreError> {
        let doc_id = doc_id.clone();
        self.blocking(move |inner| inner.list_versions(&doc_id)).await
    }

    async fn get_version(&self, id: VersionId) -> Result<Option<VersionRecord>, StoreError> {
        self.blocking(move |inner| inner.get_version(id)).await
    }

    async fn delete_versions(&self, doc_id: &DocId, ids: &[VersionId]) -> Result<usize, StoreError> {
        let doc_id = doc_id.clone();
        let ids = ids.to_vec();
        self.blocking(move |inner| inner.delete_versions(&doc_id, &ids)).await
    }
}
