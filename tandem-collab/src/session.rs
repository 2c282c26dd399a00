//! Client-side edit buffer and debounced writer.
//!
//! One [`EditSession`] per open document. It is a synchronous state machine;
//! the caller feeds it edits, server responses, remote updates and the
//! current time, and it hands back the [`WriteRequest`]s to send.
//!
//! ```text
//!          edit                 debounce expires            Accepted
//! Clean ─────────► Dirty ─────────────────────► Saving ─────────────► Clean
//!   ▲                ▲                            │  ▲                   │
//!   │                │ edit                       │  │ rebase + re-flush │ edits
//!   │                │                  Conflict  ▼  │                   ▼ buffered
//!   │          ErrorBackoff ◄── failure ── Reconciling                 Dirty
//!   │                │
//!   └──── retry ─────┘ (via Saving)
//! ```
//!
//! Only one write is ever in flight. Everything buffered since the last
//! accepted version stays in `pending` until the server confirms it.

use std::time::{Duration, Instant};
use tandem_core::{ContentCapability, ContentError};
use thiserror::Error;
use uuid::Uuid;

use crate::merger::{classify, DeferredUpdate, MergeDecision};
use crate::protocol::{ClientId, DocumentSnapshot, ErrorKind, WriteRequest, WriteResponse};
use crate::resolver;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Idle time after the last edit before a flush (1–3 s in production).
    pub debounce: Duration,
    /// A flush with no response after this long counts as a network failure.
    pub flush_timeout: Duration,
    /// Consecutive conflicts tolerated within one save cycle.
    pub max_conflict_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Local content equals the confirmed base.
    Clean,
    /// Unsaved edits, waiting for the debounce.
    Dirty,
    /// A write is in flight.
    Saving,
    /// Folding local work onto a newer server state.
    Reconciling,
    /// Last save failed; waits for a new edit or an explicit retry.
    ErrorBackoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    Saving,
    Error,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SaveFailure {
    #[error("Server rejected the write: {0}")]
    Server(ErrorKind),
    #[error("Network failure: {0}")]
    Network(String),
    #[error("Content could not be encoded or decoded: {0}")]
    Content(String),
    #[error("Gave up after {0} consecutive conflicts")]
    RetryLimit(u32),
}

impl SaveFailure {
    /// Ends the session rather than just the current save.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SaveFailure::Server(ErrorKind::Unauthorized))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SaveStatus),
    Saved { version: u64 },
    /// Local content was replaced by a remote update or a rebase; the editing
    /// surface should re-read it and restore cursor/selection if it can.
    ContentReplaced { version: u64 },
    /// Buffered operations discarded by the last rebase.
    OpsDropped { count: usize },
    SaveFailed(SaveFailure),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Content error: {0}")]
    Content(#[from] ContentError),
    #[error("{pending} unsaved operations (status {status:?})")]
    UnsavedChanges { pending: usize, status: SaveStatus },
}

/// Single-slot flush queue. Conflict re-flushes, retries and forced
/// flushes all go through here and are issued only when nothing is in flight.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushSlot {
    queued: bool,
}

impl FlushSlot {
    pub fn queue(&mut self) {
        self.queued = true;
    }

    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.queued)
    }

    pub fn clear(&mut self) {
        self.queued = false;
    }

    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

#[derive(Debug, Clone)]
struct InFlight<D> {
    request_id: u64,
    /// Exactly what was sent; becomes the base on acceptance.
    content: D,
    /// Number of leading `pending` ops the request covers.
    ops_len: usize,
    sent_at: Instant,
}

pub struct EditSession<C: ContentCapability> {
    capability: C,
    config: SessionConfig,
    document_id: Uuid,
    client_id: ClientId,

    base_version: u64,
    base_content: C::Doc,
    local: C::Doc,
    pending: Vec<C::Op>,

    state: SessionState,
    save_status: SaveStatus,
    debounce_deadline: Option<Instant>,
    in_flight: Option<InFlight<C::Doc>>,
    slot: FlushSlot,
    next_request_id: u64,
    conflict_retries: u32,
    deferred: DeferredUpdate,
    last_failure: Option<SaveFailure>,
    events: Vec<SessionEvent>,
}

impl<C: ContentCapability> EditSession<C> {
    /// Start editing from a server snapshot with a fresh client id.
    pub fn open(
        capability: C,
        snapshot: &DocumentSnapshot,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let content = capability.decode(&snapshot.content)?;
        Ok(Self {
            capability,
            config,
            document_id: snapshot.document_id,
            client_id: Uuid::new_v4(),
            base_version: snapshot.version,
            base_content: content.clone(),
            local: content,
            pending: Vec::new(),
            state: SessionState::Clean,
            save_status: SaveStatus::Saved,
            debounce_deadline: None,
            in_flight: None,
            slot: FlushSlot::default(),
            next_request_id: 1,
            conflict_retries: 0,
            deferred: DeferredUpdate::default(),
            last_failure: None,
            events: Vec::new(),
        })
    }

    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = client_id;
        self
    }

    // ── Local edits ──────────────────────────────────────────────────

    /// Apply one operation locally and buffer it.
    ///
    /// An operation the capability rejects is not buffered.
    pub fn edit(&mut self, op: C::Op, now: Instant) -> Result<(), SessionError> {
        self.local = self.capability.apply_op(&self.local, &op)?;
        self.pending.push(op);
        self.mark_dirty(now);
        Ok(())
    }

    /// Whole-state entry point: adopt `doc` as the new local content.
    pub fn replace(&mut self, doc: C::Doc, now: Instant) {
        let ops = self.capability.diff(&self.local, &doc);
        if ops.is_empty() {
            return;
        }
        self.pending.extend(ops);
        self.local = doc;
        self.mark_dirty(now);
    }

    fn mark_dirty(&mut self, now: Instant) {
        self.debounce_deadline = Some(now + self.config.debounce);
        match self.state {
            SessionState::Clean | SessionState::Dirty | SessionState::ErrorBackoff => {
                self.state = SessionState::Dirty;
            }
            SessionState::Saving | SessionState::Reconciling => {}
        }
    }

    // ── Flushing ─────────────────────────────────────────────────────

    /// Issue a write if the debounce has expired or a flush is queued, and
    /// nothing is in flight.
    pub fn poll_flush(&mut self, now: Instant) -> Option<WriteRequest> {
        if self.in_flight.is_some() {
            return None;
        }
        let debounced = self.state == SessionState::Dirty
            && self.debounce_deadline.is_some_and(|d| d <= now);
        if debounced {
            self.slot.queue();
        }
        self.issue_queued(now)
    }

    /// Skip the debounce. Used on close.
    pub fn flush_now(&mut self, now: Instant) -> Option<WriteRequest> {
        if self.has_unsaved_work() && self.state != SessionState::ErrorBackoff {
            self.slot.queue();
        }
        self.issue_queued(now)
    }

    /// Explicit user retry out of `ErrorBackoff`.
    pub fn retry(&mut self, now: Instant) -> Option<WriteRequest> {
        if self.state != SessionState::ErrorBackoff {
            return None;
        }
        if !self.has_unsaved_work() {
            self.settle_clean();
            return None;
        }
        self.slot.queue();
        self.issue_queued(now)
    }

    fn issue_queued(&mut self, now: Instant) -> Option<WriteRequest> {
        if self.in_flight.is_some() || !self.slot.take() {
            return None;
        }
        if !self.has_unsaved_work() {
            self.settle_clean();
            return None;
        }

        let content = match self.capability.encode(&self.local) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(SaveFailure::Content(e.to_string()));
                return None;
            }
        };

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.in_flight = Some(InFlight {
            request_id,
            content: self.local.clone(),
            ops_len: self.pending.len(),
            sent_at: now,
        });
        self.debounce_deadline = None;
        self.state = SessionState::Saving;
        self.set_status(SaveStatus::Saving);

        log::debug!(
            "Flushing {} ops to {} against v{} (request {request_id})",
            self.pending.len(),
            self.document_id,
            self.base_version
        );

        Some(WriteRequest {
            request_id,
            document_id: self.document_id,
            content,
            base_version: self.base_version,
            client_id: self.client_id,
        })
    }

    // ── Server responses ─────────────────────────────────────────────

    /// Feed the response to an issued write. Returns the next write to send
    /// when the response queued one (conflict re-flush).
    pub fn on_write_response(
        &mut self,
        request_id: u64,
        response: WriteResponse,
        now: Instant,
    ) -> Option<WriteRequest> {
        let in_flight = match self.in_flight.take() {
            Some(f) if f.request_id == request_id => f,
            other => {
                log::debug!("Ignoring response to unknown request {request_id}");
                self.in_flight = other;
                return None;
            }
        };

        match response {
            WriteResponse::Accepted { version } => self.on_accepted(in_flight, version, now),
            WriteResponse::Conflict { latest } => self.on_conflict(latest),
            WriteResponse::Failed { error } => self.fail(SaveFailure::Server(error)),
        }

        self.issue_queued(now)
    }

    fn on_accepted(&mut self, in_flight: InFlight<C::Doc>, version: u64, now: Instant) {
        self.base_version = self.base_version.max(version);
        self.base_content = in_flight.content;
        self.pending.drain(..in_flight.ops_len.min(self.pending.len()));
        self.conflict_retries = 0;
        self.last_failure = None;
        self.events.push(SessionEvent::Saved { version });

        match self.deferred.take_newer_than(version) {
            Some(update) if self.pending.is_empty() => self.apply_remote(update),
            Some(update) => self.deferred.offer(update),
            None => {}
        }

        if self.pending.is_empty() {
            self.settle_clean();
        } else {
            // Edits arrived while saving; they get their own debounce.
            self.state = SessionState::Dirty;
            self.debounce_deadline
                .get_or_insert(now + self.config.debounce);
        }
    }

    fn on_conflict(&mut self, latest: DocumentSnapshot) {
        self.conflict_retries += 1;
        if self.conflict_retries > self.config.max_conflict_retries {
            let n = self.conflict_retries - 1;
            self.fail(SaveFailure::RetryLimit(n));
            return;
        }

        self.state = SessionState::Reconciling;
        let latest_doc = match self.capability.decode(&latest.content) {
            Ok(doc) => doc,
            Err(e) => {
                self.fail(SaveFailure::Content(e.to_string()));
                return;
            }
        };

        let report = resolver::rebase(
            &self.capability,
            &self.base_content,
            &self.local,
            &self.pending,
            &latest_doc,
        );
        log::debug!(
            "Conflict on {}: rebased {} ops onto v{} ({} dropped)",
            self.document_id,
            report.ops.len(),
            latest.version,
            report.dropped
        );

        self.base_version = self.base_version.max(latest.version);
        self.base_content = latest_doc;
        self.local = report.content;
        self.pending = report.ops;
        self.deferred.discard_through(latest.version);

        if report.dropped > 0 {
            self.events.push(SessionEvent::OpsDropped {
                count: report.dropped,
            });
        }
        self.events.push(SessionEvent::ContentReplaced {
            version: self.base_version,
        });

        self.state = SessionState::Saving;
        self.slot.queue();
    }

    /// The transport failed or the flush timed out.
    pub fn on_network_failure(&mut self, reason: impl Into<String>) {
        if self.in_flight.take().is_some() || self.has_unsaved_work() {
            self.fail(SaveFailure::Network(reason.into()));
        }
    }

    /// Fold in the snapshot the server sends after a reconnect and resume.
    ///
    /// Without unsaved work a newer snapshot simply replaces the content.
    /// With unsaved work the buffer is written again against the old base;
    /// the gate answers with a conflict if anything else landed meanwhile,
    /// or accepts it as a self-echo if our last write got through.
    pub fn resync(&mut self, snapshot: DocumentSnapshot, now: Instant) -> Option<WriteRequest> {
        // A reply to anything sent on the old socket is never coming.
        self.in_flight = None;
        self.slot.clear();

        if !self.has_unsaved_work() {
            self.deferred.offer(snapshot);
            self.settle_clean();
            return None;
        }

        let decision = self.on_remote_update(snapshot);
        log::debug!(
            "Resync of {} with {} unsaved ops: snapshot {decision:?}",
            self.document_id,
            self.pending.len()
        );
        self.conflict_retries = 0;
        self.slot.queue();
        self.issue_queued(now)
    }

    /// Report a flush that has been outstanding for longer than the timeout.
    pub fn check_flush_timeout(&mut self, now: Instant) -> bool {
        let expired = self
            .in_flight
            .as_ref()
            .is_some_and(|f| now.saturating_duration_since(f.sent_at) >= self.config.flush_timeout);
        if expired {
            self.on_network_failure("flush timed out");
        }
        expired
    }

    /// Earliest instant at which `poll_flush` or `check_flush_timeout` has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.in_flight {
            Some(f) => Some(f.sent_at + self.config.flush_timeout),
            None if self.state == SessionState::Dirty => self.debounce_deadline,
            None => None,
        }
    }

    fn fail(&mut self, failure: SaveFailure) {
        log::warn!("Save of {} failed: {failure}", self.document_id);
        self.in_flight = None;
        self.slot.clear();
        self.debounce_deadline = None;
        self.conflict_retries = 0;
        self.state = SessionState::ErrorBackoff;
        self.set_status(SaveStatus::Error);
        self.last_failure = Some(failure.clone());
        self.events.push(SessionEvent::SaveFailed(failure));
    }

    /// Nothing left to write. A remote update deferred while work was
    /// pending is applied now if it is still ahead of the base.
    fn settle_clean(&mut self) {
        self.state = SessionState::Clean;
        self.debounce_deadline = None;
        self.set_status(SaveStatus::Saved);
        if let Some(update) = self.deferred.take_newer_than(self.base_version) {
            self.apply_remote(update);
        }
    }

    fn set_status(&mut self, status: SaveStatus) {
        if self.save_status != status {
            self.save_status = status;
            self.events.push(SessionEvent::StatusChanged(status));
        }
    }

    // ── Remote updates ───────────────────────────────────────────────

    pub fn on_remote_update(&mut self, update: DocumentSnapshot) -> MergeDecision {
        let decision = classify(&update, self.client_id, self.base_version, self.is_clean());
        match decision {
            MergeDecision::Applied => self.apply_remote(update),
            MergeDecision::Deferred => {
                log::trace!("Deferring remote v{} of {}", update.version, self.document_id);
                self.deferred.offer(update);
            }
            MergeDecision::IgnoredEcho | MergeDecision::IgnoredStale => {}
        }
        decision
    }

    fn apply_remote(&mut self, update: DocumentSnapshot) {
        match self.capability.decode(&update.content) {
            Ok(doc) => {
                self.base_version = update.version;
                self.base_content = doc.clone();
                self.local = doc;
                self.events.push(SessionEvent::ContentReplaced {
                    version: update.version,
                });
            }
            Err(e) => {
                log::warn!("Ignoring undecodable remote v{}: {e}", update.version);
            }
        }
    }

    // ── Lifecycle & accessors ────────────────────────────────────────

    /// Refuse to close while anything is unsaved.
    pub fn check_close(&self) -> Result<(), SessionError> {
        if self.save_status != SaveStatus::Saved || self.has_unsaved_work() {
            return Err(SessionError::UnsavedChanges {
                pending: self.pending.len(),
                status: self.save_status,
            });
        }
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn is_clean(&self) -> bool {
        self.state == SessionState::Clean && self.pending.is_empty() && self.in_flight.is_none()
    }

    fn has_unsaved_work(&self) -> bool {
        !self.pending.is_empty() || self.in_flight.is_some()
    }

    pub fn content(&self) -> &C::Doc {
        &self.local
    }

    pub fn base_content(&self) -> &C::Doc {
        &self.base_content
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn save_status(&self) -> SaveStatus {
        self.save_status
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_ops(&self) -> &[C::Op] {
        &self.pending
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn last_failure(&self) -> Option<&SaveFailure> {
        self.last_failure.as_ref()
    }

    pub fn deferred_update(&self) -> Option<&DocumentSnapshot> {
        self.deferred.peek()
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }
}
