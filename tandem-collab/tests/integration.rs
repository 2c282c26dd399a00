//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full write / conflict / update pipeline.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tandem_collab::client::{ClientError, ConnectionState, DriverConfig, SessionHandle, SyncClient, SyncEvent};
use tandem_collab::protocol::{ClientMessage, ErrorKind, PeerInfo, ServerMessage, WriteRequest, WriteResponse};
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::session::{SaveFailure, SaveStatus, SessionConfig, SessionError, SessionState};
use tandem_collab::gate::ShareAuthorizer;
use tandem_collab::storage::{DocumentStore, MemoryStore, ShareLevel};
use tandem_core::{TextContent, TextOp};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start an in-memory server on a free port.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

/// Start a server on a fixed port over an existing store, so a restart
/// keeps every document.
async fn start_with_store(port: u16, store: Arc<dyn DocumentStore>) -> Arc<SyncServer> {
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::with_store(config, store, Arc::new(ShareAuthorizer)));
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

fn driver_config(debounce_ms: u64) -> DriverConfig {
    DriverConfig {
        session: SessionConfig {
            debounce: Duration::from_millis(debounce_ms),
            ..SessionConfig::default()
        },
        ..DriverConfig::default()
    }
}

async fn open_text(
    url: &str,
    user: &str,
    doc_id: Uuid,
    debounce_ms: u64,
) -> SessionHandle<TextContent> {
    let mut client = SyncClient::new(PeerInfo::new(user, user), url);
    client.connect().await.unwrap();
    client
        .open_document(doc_id, TextContent::new(), driver_config(debounce_ms))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_client_connects_and_is_welcomed() {
    let (_server, url) = start_test_server().await;

    let mut client = SyncClient::new(PeerInfo::new("u1", "Alice"), &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(event, Some(SyncEvent::Connected));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
    assert_eq!(event, Some(SyncEvent::Server(ServerMessage::Welcome)));
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, url) = start_test_server().await;

    let mut client = SyncClient::new(PeerInfo::new("u1", "Alice"), &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.ping().await.unwrap();

    let got_pong = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if event == SyncEvent::Server(ServerMessage::Pong) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(got_pong);
}

#[tokio::test]
async fn test_create_then_open() {
    let (_server, url) = start_test_server().await;

    let mut client = SyncClient::new(PeerInfo::new("alice", "Alice"), &url);
    client.connect().await.unwrap();
    let doc_id = client.create_document(b"draft".to_vec()).await.unwrap();

    let handle = client
        .open_document(doc_id, TextContent::new(), driver_config(50))
        .await
        .unwrap();
    let view = handle.view();
    assert_eq!(view.content, "draft");
    assert_eq!(view.base_version, 1);
    assert_eq!(view.state, SessionState::Clean);
}

#[tokio::test]
async fn test_open_missing_document() {
    let (_server, url) = start_test_server().await;

    let mut client = SyncClient::new(PeerInfo::new("alice", "Alice"), &url);
    client.connect().await.unwrap();
    let result = client
        .open_document(Uuid::new_v4(), TextContent::new(), DriverConfig::default())
        .await;
    assert!(matches!(result, Err(ClientError::Server(ErrorKind::NotFound))));
}

#[tokio::test]
async fn test_edit_is_saved_and_reaches_other_client() {
    let (server, url) = start_test_server().await;
    let doc = server.create_document("alice", Vec::new()).unwrap();
    server
        .grant_share("alice", doc.id, "bob", ShareLevel::Edit)
        .unwrap();

    let mut alice = open_text(&url, "alice", doc.id, 30).await;
    let mut bob = open_text(&url, "bob", doc.id, 30).await;

    alice.edit(TextOp::insert(0, "Hello")).await.unwrap();

    let saved = timeout(
        Duration::from_secs(5),
        alice.wait_for(|v| v.save_status == SaveStatus::Saved && v.base_version == 2),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(saved.content, "Hello");
    assert_eq!(saved.state, SessionState::Clean);

    let seen = timeout(
        Duration::from_secs(5),
        bob.wait_for(|v| v.base_version == 2),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(seen.content, "Hello");
    assert_eq!(seen.state, SessionState::Clean);
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let (server, url) = start_test_server().await;
    let doc = server.create_document("alice", Vec::new()).unwrap();
    server
        .grant_share("alice", doc.id, "bob", ShareLevel::Edit)
        .unwrap();

    let mut alice = open_text(&url, "alice", doc.id, 20).await;
    // Bob's longer debounce makes his write arrive based on v1 after Alice's.
    let mut bob = open_text(&url, "bob", doc.id, 600).await;

    bob.edit(TextOp::insert(0, "World")).await.unwrap();
    alice.edit(TextOp::insert(0, "Hello")).await.unwrap();

    let bob_view = timeout(
        Duration::from_secs(5),
        bob.wait_for(|v| v.base_version == 3 && v.save_status == SaveStatus::Saved),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(bob_view.content, "HelloWorld");

    let alice_view = timeout(
        Duration::from_secs(5),
        alice.wait_for(|v| v.base_version == 3),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(alice_view.content, "HelloWorld");

    let stats = server.stats().await;
    assert_eq!(stats.writes_accepted, 2);
    assert_eq!(stats.write_conflicts, 1);
}

#[tokio::test]
async fn test_write_without_share_is_forbidden() {
    let (server, url) = start_test_server().await;
    let doc = server.create_document("alice", b"mine".to_vec()).unwrap();

    let mut carol = open_text(&url, "carol", doc.id, 20).await;
    assert_eq!(carol.content(), "mine");

    carol.edit(TextOp::insert(4, "!")).await.unwrap();
    let view = timeout(
        Duration::from_secs(5),
        carol.wait_for(|v| v.save_status == SaveStatus::Error),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(
        view.last_failure,
        Some(SaveFailure::Server(ErrorKind::Forbidden))
    );
    assert_eq!(view.state, SessionState::ErrorBackoff);
    assert_eq!(view.content, "mine!");

    let stored = server.gate().read(Some("alice"), doc.id).unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.content, b"mine");
}

#[tokio::test]
async fn test_close_refuses_unsaved_changes() {
    let (server, url) = start_test_server().await;
    let doc = server.create_document("alice", Vec::new()).unwrap();

    let mut alice = open_text(&url, "alice", doc.id, 10_000).await;
    alice.edit(TextOp::insert(0, "unsaved")).await.unwrap();

    let result = alice.close().await;
    assert!(matches!(
        result,
        Err(ClientError::Session(SessionError::UnsavedChanges { .. }))
    ));

    // The refused close flushed immediately instead of waiting out the debounce.
    timeout(
        Duration::from_secs(5),
        alice.wait_for(|v| v.save_status == SaveStatus::Saved && v.base_version == 2),
    )
    .await
    .unwrap()
    .unwrap();

    alice.close().await.unwrap();
    let closed = timeout(Duration::from_secs(2), alice.wait_for(|v| !v.open))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed.pending_ops, 0);
}

#[tokio::test]
async fn test_write_before_hello_is_unauthorized() {
    let (server, url) = start_test_server().await;
    let doc = server.create_document("alice", Vec::new()).unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let req = WriteRequest {
        request_id: 7,
        document_id: doc.id,
        content: b"sneaky".to_vec(),
        base_version: 1,
        client_id: Uuid::new_v4(),
    };
    let frame = ClientMessage::Write(req).encode().unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = reply else {
        panic!("expected a binary frame, got {reply:?}");
    };
    assert_eq!(
        ServerMessage::decode(&data).unwrap(),
        ServerMessage::WriteResult {
            request_id: 7,
            response: WriteResponse::Failed {
                error: ErrorKind::Unauthorized
            },
        }
    );
}

#[tokio::test]
async fn test_stale_base_gets_conflict_with_latest() {
    let (server, url) = start_test_server().await;
    let doc = server.create_document("alice", b"v1".to_vec()).unwrap();

    let mut client = SyncClient::new(PeerInfo::new("alice", "Alice"), &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    for (request_id, content) in [(1, b"v2".to_vec()), (2, b"late".to_vec())] {
        client
            .write(WriteRequest {
                request_id,
                document_id: doc.id,
                content,
                base_version: 1,
                client_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
    }

    let mut results = Vec::new();
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            if let SyncEvent::Server(ServerMessage::WriteResult { response, .. }) = event {
                results.push(response);
                if results.len() == 2 {
                    break;
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(results[0], WriteResponse::Accepted { version: 2 });
    match &results[1] {
        WriteResponse::Conflict { latest } => {
            assert_eq!(latest.version, 2);
            assert_eq!(latest.content, b"v2");
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_roster_before_hello_is_unauthorized() {
    let (server, url) = start_test_server().await;
    let doc = server.create_document("alice", Vec::new()).unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let frame = ClientMessage::RosterRequest { document_id: doc.id }
        .encode()
        .unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Binary(data) = reply else {
        panic!("expected a binary frame, got {reply:?}");
    };
    assert_eq!(
        ServerMessage::decode(&data).unwrap(),
        ServerMessage::Error(ErrorKind::Unauthorized)
    );
}

#[tokio::test]
async fn test_retry_after_server_restart_saves_buffer() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

    let first = start_with_store(port, store.clone()).await;
    let doc = first.create_document("alice", b"draft".to_vec()).unwrap();
    let mut alice = open_text(&url, "alice", doc.id, 20).await;

    first.shutdown();
    timeout(Duration::from_secs(5), alice.wait_for(|v| !v.connected))
        .await
        .unwrap()
        .unwrap();

    // Edits made while offline stay buffered.
    alice.edit(TextOp::insert(5, "!")).await.unwrap();
    let offline = timeout(
        Duration::from_secs(5),
        alice.wait_for(|v| v.state == SessionState::ErrorBackoff),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(matches!(offline.last_failure, Some(SaveFailure::Network(_))));
    assert_eq!(offline.content, "draft!");
    assert_eq!(offline.pending_ops, 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = start_with_store(port, store.clone()).await;

    alice.retry().await.unwrap();
    let saved = timeout(
        Duration::from_secs(5),
        alice.wait_for(|v| v.connected && v.save_status == SaveStatus::Saved && v.base_version == 2),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(saved.content, "draft!");
    assert_eq!(saved.state, SessionState::Clean);
    assert!(saved.last_failure.is_none());

    let stored = second.gate().read(Some("alice"), doc.id).unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.content, b"draft!");
}

#[tokio::test]
async fn test_reconnect_picks_up_writes_made_while_offline() {
    let port = free_port().await;
    let url = format!("ws://127.0.0.1:{port}");
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());

    let first = start_with_store(port, store.clone()).await;
    let doc = first.create_document("alice", b"draft".to_vec()).unwrap();
    let mut alice = open_text(&url, "alice", doc.id, 20).await;

    first.shutdown();
    timeout(Duration::from_secs(5), alice.wait_for(|v| !v.connected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alice.view().state, SessionState::Clean);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = start_with_store(port, store.clone()).await;
    second
        .gate()
        .write(
            Some("alice"),
            &WriteRequest {
                request_id: 1,
                document_id: doc.id,
                content: b"edited elsewhere".to_vec(),
                base_version: 1,
                client_id: Uuid::new_v4(),
            },
        )
        .unwrap();

    alice.retry().await.unwrap();
    let view = timeout(
        Duration::from_secs(5),
        alice.wait_for(|v| v.connected && v.base_version == 2),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(view.content, "edited elsewhere");
    assert_eq!(view.state, SessionState::Clean);

    // Updates flow again over the new subscription.
    alice.edit(TextOp::insert(0, "> ")).await.unwrap();
    let saved = timeout(
        Duration::from_secs(5),
        alice.wait_for(|v| v.save_status == SaveStatus::Saved && v.base_version == 3),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(saved.content, "> edited elsewhere");
}
