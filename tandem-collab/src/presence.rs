//! Ephemeral "who is viewing this document" presence.
//!
//! ```text
//! PresenceTracker (client)                     PresenceRoster (server)
//!   every 12s ── Heartbeat{doc} ────────────►  upsert(doc, user, now)
//!   every  6s ── RosterRequest{doc} ────────►  roster(doc, now)
//!            ◄── Roster{entries} ────────────
//!   every 15s    local sweep                   sweep(now) every 15s
//!   on close ─── Leave{doc} ────────────────►  leave(doc, user)
//! ```
//!
//! Records expire 30 seconds after their last heartbeat. All times are unix
//! milliseconds passed in by the caller, so expiry is deterministic in tests.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{ClientMessage, PeerInfo, RosterEntry};

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(12);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(6);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

fn is_live(entry: &RosterEntry, now: u64, ttl_ms: u64) -> bool {
    now.saturating_sub(entry.last_heartbeat_at) <= ttl_ms
}

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("TTL {ttl:?} must be at least twice the heartbeat interval {heartbeat:?}")]
    TtlTooShort { ttl: Duration, heartbeat: Duration },
    #[error("Roster poll interval {poll:?} must be shorter than the heartbeat interval {heartbeat:?}")]
    PollTooSlow { poll: Duration, heartbeat: Duration },
    #[error("Presence intervals must be non-zero")]
    ZeroInterval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            ttl: DEFAULT_PRESENCE_TTL,
        }
    }
}

impl PresenceConfig {
    /// A single missed heartbeat must not expire a record, and a poll must
    /// land between two heartbeats.
    pub fn validate(&self) -> Result<(), PresenceError> {
        if self.heartbeat_interval.is_zero()
            || self.poll_interval.is_zero()
            || self.sweep_interval.is_zero()
        {
            return Err(PresenceError::ZeroInterval);
        }
        if self.ttl < self.heartbeat_interval * 2 {
            return Err(PresenceError::TtlTooShort {
                ttl: self.ttl,
                heartbeat: self.heartbeat_interval,
            });
        }
        if self.poll_interval >= self.heartbeat_interval {
            return Err(PresenceError::PollTooSlow {
                poll: self.poll_interval,
                heartbeat: self.heartbeat_interval,
            });
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// Server roster
// ───────────────────────────────────────────────────────────────────

/// Presence records for every document, keyed by `(document_id, user_id)`.
pub struct PresenceRoster {
    ttl_ms: u64,
    records: HashMap<(Uuid, String), RosterEntry>,
}

impl PresenceRoster {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_ms: millis(ttl),
            records: HashMap::new(),
        }
    }

    /// Create or refresh a record. Returns `true` when the user was not
    /// already present.
    ///
    /// Repeating the same heartbeat is a no-op beyond the timestamp; an
    /// older timestamp never moves `last_heartbeat_at` backwards.
    pub fn upsert(&mut self, document_id: Uuid, peer: &PeerInfo, now: u64) -> bool {
        let key = (document_id, peer.user_id.clone());
        match self.records.get_mut(&key) {
            Some(entry) => {
                entry.display_name = peer.display_name.clone();
                entry.avatar_ref = peer.avatar_ref.clone();
                entry.last_heartbeat_at = entry.last_heartbeat_at.max(now);
                false
            }
            None => {
                self.records.insert(
                    key,
                    RosterEntry {
                        user_id: peer.user_id.clone(),
                        display_name: peer.display_name.clone(),
                        avatar_ref: peer.avatar_ref.clone(),
                        last_heartbeat_at: now,
                    },
                );
                log::debug!("Presence: {} joined {document_id}", peer.user_id);
                true
            }
        }
    }

    /// Unexpired entries for `document_id`, ordered by user id.
    pub fn roster(&self, document_id: Uuid, now: u64) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .records
            .iter()
            .filter(|((doc, _), entry)| *doc == document_id && is_live(entry, now, self.ttl_ms))
            .map(|(_, entry)| entry.clone())
            .collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn sweep(&mut self, now: u64) -> usize {
        let before = self.records.len();
        let ttl_ms = self.ttl_ms;
        self.records.retain(|_, entry| is_live(entry, now, ttl_ms));
        let removed = before - self.records.len();
        if removed > 0 {
            log::debug!("Presence sweep removed {removed} expired records");
        }
        removed
    }

    pub fn leave(&mut self, document_id: Uuid, user_id: &str) -> bool {
        let removed = self
            .records
            .remove(&(document_id, user_id.to_string()))
            .is_some();
        if removed {
            log::debug!("Presence: {user_id} left {document_id}");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Client tracker
// ───────────────────────────────────────────────────────────────────

/// Client-side presence schedule and last known roster for one document.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    document_id: Uuid,
    config: PresenceConfig,
    roster: Vec<RosterEntry>,
    next_heartbeat: u64,
    next_poll: u64,
    next_sweep: u64,
}

impl PresenceTracker {
    /// The first heartbeat and roster poll are due immediately.
    pub fn new(document_id: Uuid, config: PresenceConfig, now: u64) -> Result<Self, PresenceError> {
        config.validate()?;
        let next_sweep = now + millis(config.sweep_interval);
        Ok(Self {
            document_id,
            config,
            roster: Vec::new(),
            next_heartbeat: now,
            next_poll: now,
            next_sweep,
        })
    }

    /// Messages that are due at `now`, advancing each schedule. The local
    /// roster is swept here too when its interval has elapsed.
    pub fn poll(&mut self, now: u64) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        if now >= self.next_heartbeat {
            out.push(ClientMessage::Heartbeat {
                document_id: self.document_id,
            });
            self.next_heartbeat = now + millis(self.config.heartbeat_interval);
        }
        if now >= self.next_poll {
            out.push(ClientMessage::RosterRequest {
                document_id: self.document_id,
            });
            self.next_poll = now + millis(self.config.poll_interval);
        }
        if now >= self.next_sweep {
            self.sweep(now);
            self.next_sweep = now + millis(self.config.sweep_interval);
        }
        out
    }

    /// Earliest unix-millis instant at which [`poll`](Self::poll) has work.
    pub fn next_deadline(&self) -> u64 {
        self.next_heartbeat.min(self.next_poll).min(self.next_sweep)
    }

    /// Replace the local roster with a server response.
    pub fn on_roster(&mut self, entries: Vec<RosterEntry>, now: u64) {
        let ttl_ms = millis(self.config.ttl);
        self.roster = entries
            .into_iter()
            .filter(|e| is_live(e, now, ttl_ms))
            .collect();
    }

    pub fn sweep(&mut self, now: u64) -> usize {
        let ttl_ms = millis(self.config.ttl);
        let before = self.roster.len();
        self.roster.retain(|e| is_live(e, now, ttl_ms));
        before - self.roster.len()
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn leave_message(&self) -> ClientMessage {
        ClientMessage::Leave {
            document_id: self.document_id,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1000;

    fn alice() -> PeerInfo {
        PeerInfo::new("alice", "Alice").with_avatar("avatars/alice.png")
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let mut roster = PresenceRoster::new(DEFAULT_PRESENCE_TTL);
        let doc = Uuid::new_v4();

        assert!(roster.upsert(doc, &alice(), 5 * SEC));
        assert!(!roster.upsert(doc, &alice(), 5 * SEC));
        assert!(!roster.upsert(doc, &alice(), 5 * SEC));

        let entries = roster.roster(doc, 5 * SEC);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].last_heartbeat_at, 5 * SEC);
        assert_eq!(entries[0].avatar_ref.as_deref(), Some("avatars/alice.png"));
    }

    #[test]
    fn test_out_of_order_heartbeat_keeps_latest() {
        let mut roster = PresenceRoster::new(DEFAULT_PRESENCE_TTL);
        let doc = Uuid::new_v4();
        roster.upsert(doc, &alice(), 20 * SEC);
        roster.upsert(doc, &alice(), 10 * SEC);
        assert_eq!(roster.roster(doc, 20 * SEC)[0].last_heartbeat_at, 20 * SEC);
    }

    #[test]
    fn test_heartbeat_expiry_timeline() {
        let mut roster = PresenceRoster::new(DEFAULT_PRESENCE_TTL);
        let doc = Uuid::new_v4();
        roster.upsert(doc, &alice(), 0);

        assert_eq!(roster.roster(doc, 10 * SEC).len(), 1);
        assert!(roster.roster(doc, 40 * SEC).is_empty());

        // Expired but not yet swept; the sweep reclaims it.
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.sweep(40 * SEC), 1);
        assert!(roster.is_empty());
    }

    #[test]
    fn test_roster_is_per_document() {
        let mut roster = PresenceRoster::new(DEFAULT_PRESENCE_TTL);
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        roster.upsert(doc_a, &alice(), 0);
        roster.upsert(doc_b, &PeerInfo::new("bob", "Bob"), 0);

        let a = roster.roster(doc_a, SEC);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].user_id, "alice");
    }

    #[test]
    fn test_leave_removes_entry() {
        let mut roster = PresenceRoster::new(DEFAULT_PRESENCE_TTL);
        let doc = Uuid::new_v4();
        roster.upsert(doc, &alice(), 0);
        assert!(roster.leave(doc, "alice"));
        assert!(!roster.leave(doc, "alice"));
        assert!(roster.roster(doc, 0).is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(PresenceConfig::default().validate().is_ok());

        let short_ttl = PresenceConfig {
            ttl: Duration::from_secs(20),
            ..PresenceConfig::default()
        };
        assert!(matches!(
            short_ttl.validate(),
            Err(PresenceError::TtlTooShort { .. })
        ));

        let slow_poll = PresenceConfig {
            poll_interval: Duration::from_secs(12),
            ..PresenceConfig::default()
        };
        assert!(matches!(
            slow_poll.validate(),
            Err(PresenceError::PollTooSlow { .. })
        ));
    }

    #[test]
    fn test_tracker_schedule() {
        let doc = Uuid::new_v4();
        let mut tracker = PresenceTracker::new(doc, PresenceConfig::default(), 0).unwrap();

        let first = tracker.poll(0);
        assert_eq!(
            first,
            vec![
                ClientMessage::Heartbeat { document_id: doc },
                ClientMessage::RosterRequest { document_id: doc },
            ]
        );
        assert_eq!(tracker.next_deadline(), 6 * SEC);

        assert_eq!(
            tracker.poll(6 * SEC),
            vec![ClientMessage::RosterRequest { document_id: doc }]
        );
        assert!(tracker.poll(7 * SEC).is_empty());

        let at_12 = tracker.poll(12 * SEC);
        assert!(at_12.contains(&ClientMessage::Heartbeat { document_id: doc }));
        assert!(at_12.contains(&ClientMessage::RosterRequest { document_id: doc }));
    }

    #[test]
    fn test_tracker_local_sweep() {
        let doc = Uuid::new_v4();
        let mut tracker = PresenceTracker::new(doc, PresenceConfig::default(), 0).unwrap();
        tracker.on_roster(
            vec![RosterEntry {
                user_id: "bob".into(),
                display_name: "Bob".into(),
                avatar_ref: None,
                last_heartbeat_at: 0,
            }],
            SEC,
        );
        assert_eq!(tracker.roster().len(), 1);

        tracker.poll(15 * SEC);
        assert_eq!(tracker.roster().len(), 1);

        // Next scheduled sweep is at 30s; bob is still exactly at the TTL.
        tracker.poll(30 * SEC);
        assert_eq!(tracker.roster().len(), 1);
        assert_eq!(tracker.sweep(31 * SEC), 1);
        assert_eq!(tracker.leave_message(), ClientMessage::Leave { document_id: doc });
    }
}
