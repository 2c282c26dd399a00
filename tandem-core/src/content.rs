//! Pluggable content capability.
//!
//! The synchronization protocol never looks inside document content. Each
//! document kind supplies a [`ContentCapability`] that knows how to apply an
//! edit, diff two states, rebase buffered edits, and merge whole states.

use std::fmt::Debug;
use thiserror::Error;

/// How buffered local edits are reconciled after a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Linear stream of replayable operations (rich text).
    Stream,
    /// Set of independently identified elements (canvas).
    WholeState,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("Operation out of range: {0}")]
    OutOfRange(String),
    #[error("Operation target mismatch: {0}")]
    TargetMismatch(String),
    #[error("Element not found: {0}")]
    ElementNotFound(String),
    #[error("Malformed content: {0}")]
    Malformed(String),
}

/// Document-kind specific editing primitives consumed by the sync layer.
pub trait ContentCapability: Send + Sync + 'static {
    type Doc: Clone + PartialEq + Debug + Send + Sync + 'static;
    type Op: Clone + PartialEq + Debug + Send + Sync + 'static;

    fn kind(&self) -> ContentKind;

    /// Apply one operation, returning the new state.
    ///
    /// Fails when the operation's target no longer exists in `doc`.
    fn apply_op(&self, doc: &Self::Doc, op: &Self::Op) -> Result<Self::Doc, ContentError>;

    /// Operations that turn `old` into `new` when applied in order.
    fn diff(&self, old: &Self::Doc, new: &Self::Doc) -> Vec<Self::Op>;

    /// Three-way merge of a locally edited state onto a newer remote state.
    ///
    /// `ancestor` is the state both sides started from.
    fn merge_whole_state(
        &self,
        local: &Self::Doc,
        remote: &Self::Doc,
        ancestor: &Self::Doc,
    ) -> Self::Doc;

    /// Map `local` operations (defined against the common ancestor) past the
    /// `upstream` operations. `None` marks an operation whose target region was
    /// altered upstream.
    fn rebase_ops(&self, local: &[Self::Op], _upstream: &[Self::Op]) -> Vec<Option<Self::Op>> {
        local.iter().cloned().map(Some).collect()
    }

    /// Serialize for the wire and for storage.
    fn encode(&self, doc: &Self::Doc) -> Result<Vec<u8>, ContentError>;

    /// Parse wire bytes. Malformed or drifted payloads are rejected here.
    fn decode(&self, bytes: &[u8]) -> Result<Self::Doc, ContentError>;

    /// Apply a sequence of operations, stopping at the first failure.
    fn apply_all(&self, doc: &Self::Doc, ops: &[Self::Op]) -> Result<Self::Doc, ContentError> {
        let mut current = doc.clone();
        for op in ops {
            current = self.apply_op(&current, op)?;
        }
        Ok(current)
    }
}
