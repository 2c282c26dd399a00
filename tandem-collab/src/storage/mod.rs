//! Persistent storage for authoritative document records.
//!
//! The version gate only needs two primitives: read a record, and replace it
//! if it is still exactly the record that was read.
//!
//! ```text
//! ┌─────────────┐  get / compare_and_set  ┌──────────────────────────┐
//! │ VersionGate │ ──────────────────────► │ dyn DocumentStore        │
//! └─────────────┘                         │  ├── MemoryStore (tests) │
//!                                         │  └── RocksStore (disk)   │
//!                                         └──────────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{unix_millis, ClientId, DocumentSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareLevel {
    View,
    Edit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub user_id: String,
    pub level: ShareLevel,
}

/// The server-owned record of one collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    /// Opaque bytes produced by the document's content capability.
    pub content: Vec<u8>,
    /// Starts at 1; each accepted write adds exactly 1.
    pub version: u64,
    /// Client that produced `version` (nil for a freshly created record).
    pub last_writer_id: ClientId,
    /// Unix milliseconds.
    pub updated_at: u64,
    pub owner_id: String,
    pub shares: Vec<Share>,
}

impl DocumentRecord {
    pub fn new(owner_id: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            version: 1,
            last_writer_id: Uuid::nil(),
            updated_at: unix_millis(),
            owner_id: owner_id.into(),
            shares: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: self.id,
            content: self.content.clone(),
            version: self.version,
            last_writer_id: self.last_writer_id,
        }
    }

    pub fn share_level(&self, user_id: &str) -> Option<ShareLevel> {
        self.shares
            .iter()
            .find(|s| s.user_id == user_id)
            .map(|s| s.level)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(Uuid),
    #[error("Document already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Atomic get / compare-and-set persistence primitive.
pub trait DocumentStore: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<DocumentRecord>, StoreError>;

    /// Insert a brand-new record. Fails if the id is taken.
    fn insert(&self, record: DocumentRecord) -> Result<(), StoreError>;

    /// Replace the record with `record.id` only if the stored record still
    /// equals `expected`. Returns `false` when any other change (a write or a
    /// share grant) got there first.
    fn compare_and_set(
        &self,
        expected: &DocumentRecord,
        record: DocumentRecord,
    ) -> Result<bool, StoreError>;

    fn list(&self) -> Result<Vec<Uuid>, StoreError>;
}
