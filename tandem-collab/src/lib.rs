//! # tandem-collab - Optimistic versioned sync for collaborative documents
//!
//! Clients edit locally and flush debounced snapshots to a server that
//! accepts a write only if it was based on the current version. A rejected
//! write comes back with the latest state, which the client folds its
//! unsent work into before trying again.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                      ┌──────────────┐
//! │ EditSession  │   WriteRequest       │ SyncServer   │
//! │ (per doc)    │ ───────────────────► │              │
//! │  Clean/Dirty │   WriteResult        │ VersionGate  │──► DocumentStore
//! │  Saving/...  │ ◄─────────────────── │ (CAS)        │    (RocksDB)
//! └──────┬───────┘                      └──────┬───────┘
//!        │ Conflict                            │ Accepted
//!        ▼                                     ▼
//! ┌──────────────┐   Update(snapshot)   ┌──────────────┐
//! │ resolver /   │ ◄─────────────────── │ RoomManager  │
//! │ merger       │                      │ (fan-out)    │
//! └──────────────┘                      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`storage`]: Document records, in-memory and RocksDB stores
//! - [`gate`]: Version-checked writes with authorization
//! - [`broadcast`]: Per-document fan-out of accepted writes
//! - [`presence`]: Heartbeat roster with TTL expiry
//! - [`merger`]: Classification of incoming remote updates
//! - [`resolver`]: Rebase of local work after a conflict
//! - [`session`]: Client edit state machine (debounce, flush, retry)
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client and session driver

pub mod protocol;
pub mod storage;
pub mod gate;
pub mod broadcast;
pub mod presence;
pub mod merger;
pub mod resolver;
pub mod session;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    ClientId, ClientMessage, DocumentSnapshot, ErrorKind, PeerInfo, ProtocolError, RosterEntry,
    ServerMessage, WriteRequest, WriteResponse,
};
pub use storage::{
    DocumentRecord, DocumentStore, MemoryStore, RocksStore, Share, ShareLevel, StoreConfig,
    StoreError,
};
pub use gate::{GateError, GateStats, ShareAuthorizer, VersionGate, WriteAuthorizer, WriteOutcome};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use presence::{PresenceConfig, PresenceError, PresenceRoster, PresenceTracker};
pub use merger::{DeferredUpdate, MergeDecision};
pub use resolver::RebaseReport;
pub use session::{
    EditSession, SaveFailure, SaveStatus, SessionConfig, SessionError, SessionEvent, SessionState,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{
    ClientError, ConnectionState, DriverConfig, SessionHandle, SessionView, SyncClient, SyncEvent,
};
