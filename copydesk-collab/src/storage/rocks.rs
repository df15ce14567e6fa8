//! RocksDB-backed collaboration store.
//!
//! Column families:
//! - `sessions`      keyed by session id (16 bytes), bincode `SessionRecord`
//! - `comments`      keyed by comment id, bincode `Comment`
//! - `workflows`     keyed by workflow id, bincode `WorkflowRecord`
//! - `content_index` secondary index, empty values:
//!   `<tag:1><content id><0x00><record id:16>` with tag `c` (comment) or `w` (workflow)
//!
//! Record and index rows are written in one `WriteBatch`.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{decode, encode, CollabStore, SessionRecord, StoreError, WorkflowRecord};
use crate::comments::Comment;

const CF_SESSIONS: &str = "sessions";
const CF_COMMENTS: &str = "comments";
const CF_WORKFLOWS: &str = "workflows";
const CF_CONTENT_INDEX: &str = "content_index";

const COLUMN_FAMILIES: &[&str] = &[CF_SESSIONS, CF_COMMENTS, CF_WORKFLOWS, CF_CONTENT_INDEX];

const TAG_COMMENT: u8 = b'c';
const TAG_WORKFLOW: u8 = b'w';

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
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            ..Self::new(path)
        }
    }
}

pub struct RocksStore {
    /// Single-threaded mode: column families are fixed at open
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
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

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SESSIONS | CF_COMMENTS | CF_WORKFLOWS => {
                // Point lookups by id.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_CONTENT_INDEX => {
                // Tiny keys, prefix-scanned per content item.
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf_name: &str, id: Uuid) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn index_prefix(tag: u8, content_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(content_id.len() + 2);
        key.push(tag);
        key.extend_from_slice(content_id.as_bytes());
        key.push(0);
        key
    }

    fn index_key(tag: u8, content_id: &str, id: Uuid) -> Vec<u8> {
        let mut key = Self::index_prefix(tag, content_id);
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Record ids indexed under `content_id`, in key order.
    fn indexed_ids(&self, tag: u8, content_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_CONTENT_INDEX)?;
        let prefix = Self::index_prefix(tag, content_id);

        let mut ids = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let raw: [u8; 16] = key[prefix.len()..]
                .try_into()
                .map_err(|_| StoreError::DeserializationError("Invalid UUID in index key".into()))?;
            ids.push(Uuid::from_bytes(raw));
        }
        Ok(ids)
    }
}

#[async_trait]
impl CollabStore for RocksStore {
    async fn put_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, record.session_id.as_bytes(), encode(record)?);
        self.write(batch)
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        self.get(CF_SESSIONS, session_id)
    }

    async fn deactivate_session(&self, session_id: Uuid) -> Result<bool, StoreError> {
        let Some(mut record) = self.get::<SessionRecord>(CF_SESSIONS, session_id)? else {
            return Ok(false);
        };
        if record.active {
            record.active = false;
            self.put_session(&record).await?;
        }
        Ok(true)
    }

    async fn expired_sessions(&self, now: u64) -> Result<Vec<SessionRecord>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut expired = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            // One unreadable row must not hide the others from the sweep.
            let record: SessionRecord = match decode(&value) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Skipping undecodable session row {key:02x?}: {e}");
                    continue;
                }
            };
            if record.active && record.expires_at <= now {
                expired.push(record);
            }
        }
        Ok(expired)
    }

    async fn put_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        let cf = self.cf(CF_COMMENTS)?;
        let cf_index = self.cf(CF_CONTENT_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, comment.id.as_bytes(), encode(comment)?);
        batch.put_cf(
            &cf_index,
            Self::index_key(TAG_COMMENT, &comment.content_id, comment.id),
            b"",
        );
        self.write(batch)
    }

    async fn load_comment(&self, comment_id: Uuid) -> Result<Option<Comment>, StoreError> {
        self.get(CF_COMMENTS, comment_id)
    }

    async fn list_comments(&self, content_id: &str) -> Result<Vec<Comment>, StoreError> {
        let mut comments = Vec::new();
        for id in self.indexed_ids(TAG_COMMENT, content_id)? {
            match self.get::<Comment>(CF_COMMENTS, id)? {
                Some(comment) => comments.push(comment),
                None => log::warn!("Index entry for missing comment {id} on {content_id}"),
            }
        }
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_WORKFLOWS)?;
        let cf_index = self.cf(CF_CONTENT_INDEX)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, record.workflow_id.as_bytes(), encode(record)?);
        batch.put_cf(
            &cf_index,
            Self::index_key(TAG_WORKFLOW, &record.content_id, record.workflow_id),
            b"",
        );
        self.write(batch)
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Option<WorkflowRecord>, StoreError> {
        self.get(CF_WORKFLOWS, workflow_id)
    }

    async fn list_workflows(&self, content_id: &str) -> Result<Vec<WorkflowRecord>, StoreError> {
        let mut workflows = Vec::new();
        for id in self.indexed_ids(TAG_WORKFLOW, content_id)? {
            if let Some(record) = self.get::<WorkflowRecord>(CF_WORKFLOWS, id)? {
                workflows.push(record);
            }
        }
        Ok(workflows)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
