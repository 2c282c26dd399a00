//! Server-side version gate.
//!
//! Every write names the version it was based on. The gate accepts it only
//! when nothing else was accepted in between. The final replace is a
//! compare-and-set against the whole record that was read, so a share grant
//! landing in between also forces a re-read:
//!
//! ```text
//! authorize ──► read record ──► version == base  ─┐
//!   │                │          or self-echo      ├─► CAS(v → v+1) ──► Accepted
//!   ▼                │                            │        │ lost race
//! Forbidden          ├─► version > base ──► Conflict{latest}│
//! Unauthorized       └─► version < base ──► InvalidState   └─► re-read
//! NotFound
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{unix_millis, DocumentSnapshot, ErrorKind, WriteRequest};
use crate::storage::{DocumentRecord, DocumentStore, Share, ShareLevel, StoreError};

/// Yes/no write permission predicate. Permission computation lives elsewhere.
pub trait WriteAuthorizer: Send + Sync {
    fn can_write(&self, user_id: &str, record: &DocumentRecord) -> bool;
}

/// Owner, or anyone holding an `Edit` share.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShareAuthorizer;

impl WriteAuthorizer for ShareAuthorizer {
    fn can_write(&self, user_id: &str, record: &DocumentRecord) -> bool {
        record.owner_id == user_id || record.share_level(user_id) == Some(ShareLevel::Edit)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Caller is not authenticated")]
    Unauthorized,
    #[error("Caller may not write document {0}")]
    Forbidden(Uuid),
    #[error("Document not found: {0}")]
    NotFound(Uuid),
    #[error("Base version {base} is ahead of stored version {stored}")]
    InvalidState { base: u64, stored: u64 },
    #[error("Content rejected: {0}")]
    ContentRejected(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl GateError {
    /// Wire-level classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::Unauthorized => ErrorKind::Unauthorized,
            GateError::Forbidden(_) => ErrorKind::Forbidden,
            GateError::NotFound(_) => ErrorKind::NotFound,
            GateError::InvalidState { .. } => ErrorKind::InvalidState,
            GateError::ContentRejected(_) => ErrorKind::ContentRejected,
            GateError::Store(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Persisted; `snapshot` is what gets broadcast.
    Accepted { version: u64, snapshot: DocumentSnapshot },
    /// Someone else wrote first.
    Conflict { latest: DocumentSnapshot },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GateStats {
    pub accepted: u64,
    pub conflicts: u64,
    pub rejected: u64,
    /// CAS attempts that lost a race and were re-evaluated.
    pub cas_retries: u64,
}

#[derive(Default)]
struct AtomicGateStats {
    accepted: AtomicU64,
    conflicts: AtomicU64,
    rejected: AtomicU64,
    cas_retries: AtomicU64,
}

pub struct VersionGate {
    store: Arc<dyn DocumentStore>,
    authorizer: Arc<dyn WriteAuthorizer>,
    max_content_bytes: Option<usize>,
    stats: AtomicGateStats,
}

impl VersionGate {
    pub fn new(store: Arc<dyn DocumentStore>, authorizer: Arc<dyn WriteAuthorizer>) -> Self {
        Self {
            store,
            authorizer,
            max_content_bytes: None,
            stats: AtomicGateStats::default(),
        }
    }

    /// Reject content larger than `limit` bytes as `ContentRejected`.
    pub fn with_max_content_bytes(mut self, limit: usize) -> Self {
        self.max_content_bytes = Some(limit);
        self
    }

    fn check_content(&self, content: &[u8]) -> Result<(), GateError> {
        match self.max_content_bytes {
            Some(limit) if content.len() > limit => Err(GateError::ContentRejected(format!(
                "{} bytes exceeds limit of {limit}",
                content.len()
            ))),
            _ => Ok(()),
        }
    }

    /// Create a document owned by `caller` at version 1.
    pub fn create(&self, caller: Option<&str>, content: Vec<u8>) -> Result<DocumentRecord, GateError> {
        let owner = caller.ok_or(GateError::Unauthorized)?;
        self.check_content(&content)?;

        let record = DocumentRecord::new(owner, content);
        self.store.insert(record.clone())?;
        log::info!("Created document {} for {owner}", record.id);
        Ok(record)
    }

    /// Current snapshot. Any authenticated caller may read.
    pub fn read(&self, caller: Option<&str>, document_id: Uuid) -> Result<DocumentSnapshot, GateError> {
        caller.ok_or(GateError::Unauthorized)?;
        let record = self
            .store
            .get(document_id)?
            .ok_or(GateError::NotFound(document_id))?;
        Ok(record.snapshot())
    }

    /// Evaluate one write against the stored record.
    pub fn write(&self, caller: Option<&str>, req: &WriteRequest) -> Result<WriteOutcome, GateError> {
        let result = self.evaluate(caller, req);
        match &result {
            Ok(WriteOutcome::Accepted { .. }) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Ok(WriteOutcome::Conflict { .. }) => {
                self.stats.conflicts.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn evaluate(&self, caller: Option<&str>, req: &WriteRequest) -> Result<WriteOutcome, GateError> {
        let caller = caller.ok_or(GateError::Unauthorized)?;
        let doc_id = req.document_id;

        loop {
            let stored = self.store.get(doc_id)?.ok_or(GateError::NotFound(doc_id))?;

            if !self.authorizer.can_write(caller, &stored) {
                log::debug!("Write to {doc_id} by {caller} forbidden");
                return Err(GateError::Forbidden(doc_id));
            }
            self.check_content(&req.content)?;

            let self_echo = !req.client_id.is_nil() && stored.last_writer_id == req.client_id;

            if stored.version != req.base_version && !self_echo {
                if stored.version > req.base_version {
                    log::debug!(
                        "Conflict on {doc_id}: base {} behind stored {}",
                        req.base_version,
                        stored.version
                    );
                    return Ok(WriteOutcome::Conflict {
                        latest: stored.snapshot(),
                    });
                }
                return Err(GateError::InvalidState {
                    base: req.base_version,
                    stored: stored.version,
                });
            }

            let expected = stored.version;
            let next = DocumentRecord {
                content: req.content.clone(),
                version: expected + 1,
                last_writer_id: req.client_id,
                updated_at: unix_millis(),
                ..stored.clone()
            };

            if self.store.compare_and_set(&stored, next.clone())? {
                log::debug!(
                    "Accepted write to {doc_id} from {}: v{expected} -> v{}",
                    req.client_id,
                    next.version
                );
                return Ok(WriteOutcome::Accepted {
                    version: next.version,
                    snapshot: next.snapshot(),
                });
            }

            self.stats.cas_retries.fetch_add(1, Ordering::Relaxed);
            log::trace!("Record {doc_id} changed under v{expected}, re-evaluating");
        }
    }

    /// Add or replace a share. Only the owner may grant.
    ///
    /// Does not bump the version.
    pub fn grant_share(
        &self,
        caller: Option<&str>,
        document_id: Uuid,
        user_id: &str,
        level: ShareLevel,
    ) -> Result<(), GateError> {
        let caller = caller.ok_or(GateError::Unauthorized)?;

        loop {
            let stored = self
                .store
                .get(document_id)?
                .ok_or(GateError::NotFound(document_id))?;
            if stored.owner_id != caller {
                return Err(GateError::Forbidden(document_id));
            }

            let mut record = stored.clone();
            record.shares.retain(|s| s.user_id != user_id);
            record.shares.push(Share {
                user_id: user_id.to_string(),
                level,
            });

            if self.store.compare_and_set(&stored, record)? {
                log::info!("Granted {level:?} on {document_id} to {user_id}");
                return Ok(());
            }
            log::trace!("Record {document_id} changed during grant, retrying");
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            conflicts: self.stats.conflicts.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            cas_retries: self.stats.cas_retries.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}
