//! Durable storage behind the collaboration core.
//!
//! ```text
//! ┌─────────────────┐  put/load/list   ┌──────────────────────────────────┐
//! │ SessionRegistry │ ───────────────► │ dyn CollabStore                  │
//! │ CommentManager  │                  │  ├─ MemoryStore (tests, no path) │
//! │ WorkflowEngine  │                  │  └─ RocksStore                   │
//! │ SessionSweeper  │                  │      CF sessions / comments /    │
//! └─────────────────┘                  │         workflows / content_index│
//!                                      └──────────────────────────────────┘
//! ```
//!
//! Records are bincode-encoded. Opaque blobs inside records (session state,
//! workflow steps and decisions) are JSON compressed with LZ4.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::comments::Comment;
use crate::config::CollabConfig;
use crate::session::Permissions;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    DatabaseError(String),
    #[error("record not found: {0}")]
    NotFound(Uuid),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("deserialization error: {0}")]
    DeserializationError(String),
    #[error("compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Row of the session table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: String,
    pub content_id: String,
    /// Compressed JSON of the session's cursor, token and undo state
    pub state: Vec<u8>,
    pub permissions: Permissions,
    pub last_activity: u64,
    pub expires_at: u64,
    /// Cleared on leave and on expiry
    pub active: bool,
}

/// Row of the workflow table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: Uuid,
    pub content_id: String,
    pub kind: String,
    pub current_step: u64,
    pub total_steps: u64,
    /// Compressed JSON of steps and decision log
    pub data: Vec<u8>,
    /// Every assignee of every step
    pub assignees: Vec<String>,
    pub status: String,
    pub updated_at: u64,
}

#[async_trait]
pub trait CollabStore: Send + Sync {
    async fn put_session(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn load_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError>;
    /// Mark a session inactive. Returns `false` if it was unknown.
    async fn deactivate_session(&self, session_id: Uuid) -> Result<bool, StoreError>;
    /// Active sessions whose expiry is at or before `now`.
    async fn expired_sessions(&self, now: u64) -> Result<Vec<SessionRecord>, StoreError>;

    async fn put_comment(&self, comment: &Comment) -> Result<(), StoreError>;
    async fn load_comment(&self, comment_id: Uuid) -> Result<Option<Comment>, StoreError>;
    async fn list_comments(&self, content_id: &str) -> Result<Vec<Comment>, StoreError>;

    async fn put_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError>;
    async fn load_workflow(&self, workflow_id: Uuid) -> Result<Option<WorkflowRecord>, StoreError>;
    async fn list_workflows(&self, content_id: &str) -> Result<Vec<WorkflowRecord>, StoreError>;
}

/// Open the configured backend: RocksDB when a path is set, memory otherwise.
pub fn open_store(config: &CollabConfig) -> Result<Arc<dyn CollabStore>, StoreError> {
    match &config.storage_path {
        Some(path) => {
            log::info!("Opening RocksDB store at {}", path.display());
            Ok(Arc::new(RocksStore::open(StoreConfig::new(path))?))
        }
        None => {
            log::info!("No storage path configured, using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// JSON-encode and LZ4-compress a blob.
pub fn pack_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

pub fn unpack_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_json() {
        let value = serde_json::json!({"cursor": 12, "history": [1, 2, 3]});
        let packed = pack_json(&value).unwrap();
        let back: serde_json::Value = unpack_json(&packed).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_unpack_garbage() {
        let err = unpack_json::<serde_json::Value>(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, StoreError::CompressionError(_)));
    }

    #[test]
    fn test_record_encoding() {
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: "u1".into(),
            content_id: "c1".into(),
            state: vec![1, 2, 3],
            permissions: Permissions::full(),
            last_activity: 5,
            expires_at: 10,
            active: true,
        };
        let bytes = encode(&record).unwrap();
        assert_eq!(decode::<SessionRecord>(&bytes).unwrap(), record);
    }
}
