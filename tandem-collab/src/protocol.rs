//! Binary protocol for versioned document synchronization.
//!
//! Every WebSocket frame carries exactly one bincode-encoded message:
//! ```text
//! client ──► server : ClientMessage (Hello, Subscribe, Write, Heartbeat, …)
//! server ──► client : ServerMessage (Snapshot, WriteResult, Update, Roster, …)
//! ```
//!
//! Document content is opaque here; the content capability encodes it.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Random per-session identifier used to recognise a client's own echoed writes.
pub type ClientId = Uuid;

/// Authenticated caller identity plus presence display metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// The authoritative state of a document at one version.
///
/// Sent as the initial subscription snapshot, as the `latest` of a
/// conflict, and as the broadcast payload after every accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document_id: Uuid,
    pub content: Vec<u8>,
    pub version: u64,
    pub last_writer_id: ClientId,
}

/// A flush from a client's edit buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Correlates the response; unique per client session.
    pub request_id: u64,
    pub document_id: Uuid,
    pub content: Vec<u8>,
    pub base_version: u64,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteResponse {
    Accepted { version: u64 },
    Conflict { latest: DocumentSnapshot },
    Failed { error: ErrorKind },
}

/// Terminal failures reported over the wire.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden")]
    Forbidden,
    #[error("Document not found")]
    NotFound,
    #[error("Base version ahead of stored version")]
    InvalidState,
    #[error("Content rejected")]
    ContentRejected,
    #[error("Internal server error")]
    Internal,
}

/// One user in a document's presence roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    /// Unix milliseconds of the last heartbeat.
    pub last_heartbeat_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Establish the caller identity for this connection.
    Hello(PeerInfo),
    /// Create a new document owned by the caller, at version 1.
    Create { content: Vec<u8> },
    Subscribe { document_id: Uuid },
    Unsubscribe { document_id: Uuid },
    Write(WriteRequest),
    Heartbeat { document_id: Uuid },
    RosterRequest { document_id: Uuid },
    Leave { document_id: Uuid },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Welcome,
    Created { document_id: Uuid, version: u64 },
    Snapshot(DocumentSnapshot),
    WriteResult { request_id: u64, response: WriteResponse },
    /// Pushed to every subscriber after an accepted write.
    Update(DocumentSnapshot),
    HeartbeatAck { document_id: Uuid },
    Roster { document_id: Uuid, entries: Vec<RosterEntry> },
    Error(ErrorKind),
    Pong,
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Unexpected message: {0}")]
    Unexpected(String),
}

/// Wall-clock unix milliseconds, used for `updated_at` and heartbeats.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_request_roundtrip() {
        let req = WriteRequest {
            request_id: 7,
            document_id: Uuid::new_v4(),
            content: b"Hello".to_vec(),
            base_version: 3,
            client_id: Uuid::new_v4(),
        };
        let msg = ClientMessage::Write(req.clone());
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, ClientMessage::Write(req));
    }

    #[test]
    fn test_conflict_carries_latest() {
        let latest = DocumentSnapshot {
            document_id: Uuid::new_v4(),
            content: b"Hello".to_vec(),
            version: 4,
            last_writer_id: Uuid::new_v4(),
        };
        let msg = ServerMessage::WriteResult {
            request_id: 1,
            response: WriteResponse::Conflict { latest: latest.clone() },
        };

        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::WriteResult {
                response: WriteResponse::Conflict { latest: got },
                ..
            } => assert_eq!(got, latest),
            other => panic!("Expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_update_overhead_is_small() {
        let msg = ServerMessage::Update(DocumentSnapshot {
            document_id: Uuid::new_v4(),
            content: vec![0u8; 50],
            version: 12,
            last_writer_id: Uuid::new_v4(),
        });
        let encoded = msg.encode().unwrap();
        // Two UUIDs, a varint version, a length prefix, the tag.
        assert!(encoded.len() < 100, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_roster_with_avatar() {
        let entry = RosterEntry {
            user_id: "u1".into(),
            display_name: "Alice".into(),
            avatar_ref: Some("avatars/alice.png".into()),
            last_heartbeat_at: 1_700_000_000_000,
        };
        let msg = ServerMessage::Roster {
            document_id: Uuid::new_v4(),
            entries: vec![entry.clone()],
        };
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::Roster { entries, .. } => assert_eq!(entries, vec![entry]),
            other => panic!("Expected roster, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            ServerMessage::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::Forbidden.to_string(), "Forbidden");
        assert_eq!(ErrorKind::NotFound.to_string(), "Document not found");
    }

    #[test]
    fn test_unix_millis_advances() {
        let a = unix_millis();
        let b = unix_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
