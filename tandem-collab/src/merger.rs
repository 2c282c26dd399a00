//! Remote update classification.
//!
//! Every `Update` pushed by the server is sorted into exactly one bucket:
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | written by this client | `IgnoredEcho` |
//! | `version <= base_version` | `IgnoredStale` |
//! | session is clean | `Applied` |
//! | anything buffered or in flight | `Deferred` |
//!
//! Deferred updates wait in a [`DeferredUpdate`] slot that keeps only the
//! newest one. The pending flush either conflicts (and the resolver absorbs
//! the newer state) or is accepted, at which point the slot is drained.

use crate::protocol::{ClientId, DocumentSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    IgnoredEcho,
    IgnoredStale,
    Applied,
    Deferred,
}

pub fn classify(
    update: &DocumentSnapshot,
    own_client_id: ClientId,
    base_version: u64,
    is_clean: bool,
) -> MergeDecision {
    if !own_client_id.is_nil() && update.last_writer_id == own_client_id {
        MergeDecision::IgnoredEcho
    } else if update.version <= base_version {
        MergeDecision::IgnoredStale
    } else if is_clean {
        MergeDecision::Applied
    } else {
        MergeDecision::Deferred
    }
}

/// Newest remote update that arrived while local work was pending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredUpdate {
    slot: Option<DocumentSnapshot>,
}

impl DeferredUpdate {
    /// Keep `update` if it is newer than what is already held.
    pub fn offer(&mut self, update: DocumentSnapshot) {
        match &self.slot {
            Some(held) if held.version >= update.version => {}
            _ => self.slot = Some(update),
        }
    }

    /// After the server accepted our write at `accepted_version`: a held
    /// update at or below it is superseded and dropped; a newer one is
    /// handed back for application.
    pub fn take_newer_than(&mut self, accepted_version: u64) -> Option<DocumentSnapshot> {
        match self.slot.take() {
            Some(update) if update.version > accepted_version => Some(update),
            _ => None,
        }
    }

    /// Drop whatever is held once the resolver has adopted `version`.
    pub fn discard_through(&mut self, version: u64) {
        if matches!(&self.slot, Some(held) if held.version <= version) {
            self.slot = None;
        }
    }

    pub fn peek(&self) -> Option<&DocumentSnapshot> {
        self.slot.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn update(version: u64, writer: ClientId) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: Uuid::nil(),
            content: Vec::new(),
            version,
            last_writer_id: writer,
        }
    }

    #[test]
    fn test_classification_order() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();

        // Echo wins even over staleness.
        assert_eq!(classify(&update(3, me), me, 5, true), MergeDecision::IgnoredEcho);
        assert_eq!(classify(&update(5, other), me, 5, true), MergeDecision::IgnoredStale);
        assert_eq!(classify(&update(4, other), me, 5, false), MergeDecision::IgnoredStale);
        assert_eq!(classify(&update(6, other), me, 5, true), MergeDecision::Applied);
        assert_eq!(classify(&update(6, other), me, 5, false), MergeDecision::Deferred);
    }

    #[test]
    fn test_nil_writer_is_never_an_echo() {
        let nil = Uuid::nil();
        assert_eq!(classify(&update(6, nil), nil, 5, true), MergeDecision::Applied);
    }

    #[test]
    fn test_deferred_keeps_newest() {
        let other = Uuid::new_v4();
        let mut deferred = DeferredUpdate::default();

        deferred.offer(update(7, other));
        deferred.offer(update(6, other));
        assert_eq!(deferred.peek().map(|u| u.version), Some(7));

        deferred.offer(update(9, other));
        assert_eq!(deferred.peek().map(|u| u.version), Some(9));
    }

    #[test]
    fn test_accept_supersedes_older_deferred() {
        let other = Uuid::new_v4();
        let mut deferred = DeferredUpdate::default();

        deferred.offer(update(4, other));
        assert_eq!(deferred.take_newer_than(4), None);
        assert!(deferred.is_empty());

        deferred.offer(update(8, other));
        assert_eq!(deferred.take_newer_than(6).map(|u| u.version), Some(8));
        assert!(deferred.is_empty());
    }

    #[test]
    fn test_discard_through() {
        let other = Uuid::new_v4();
        let mut deferred = DeferredUpdate::default();

        deferred.offer(update(5, other));
        deferred.discard_through(4);
        assert!(!deferred.is_empty());
        deferred.discard_through(5);
        assert!(deferred.is_empty());
    }
}
