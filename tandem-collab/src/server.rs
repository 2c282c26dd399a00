//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                         ┌── VersionGate ── DocumentStore
//!             ├── connection task ──────┤                 (RocksDB / memory)
//! Client B ──┘   (one per socket)      ├── RoomManager ── BroadcastGroup per doc
//!                                      └── PresenceRoster (swept every 15s)
//! ```
//!
//! Each connection task decodes `ClientMessage`s, answers on its own socket
//! and, for every subscribed document, runs a forwarder that copies the
//! room's pre-encoded `Update` frames to the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::gate::{GateError, ShareAuthorizer, VersionGate, WriteAuthorizer, WriteOutcome};
use crate::presence::{PresenceRoster, DEFAULT_PRESENCE_TTL, DEFAULT_SWEEP_INTERVAL};
use crate::protocol::{
    unix_millis, ClientMessage, DocumentSnapshot, PeerInfo, ServerMessage, WriteRequest,
    WriteResponse,
};
use crate::storage::{
    DocumentRecord, DocumentStore, MemoryStore, RocksStore, ShareLevel, StoreConfig, StoreError,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Update frames buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Presence record lifetime after the last heartbeat
    pub presence_ttl: Duration,
    /// How often expired presence records are reclaimed
    pub presence_sweep_interval: Duration,
    /// Largest accepted document payload
    pub max_content_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
            presence_ttl: DEFAULT_PRESENCE_TTL,
            presence_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_content_bytes: Some(8 * 1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub writes_accepted: u64,
    pub write_conflicts: u64,
    pub writes_rejected: u64,
    pub active_rooms: usize,
    pub presence_records: usize,
}

#[derive(Debug, Default)]
struct ConnectionStats {
    total_connections: u64,
    active_connections: u64,
    total_messages: u64,
    total_bytes: u64,
}

/// Shared by every connection task.
#[derive(Clone)]
struct Shared {
    gate: Arc<VersionGate>,
    rooms: Arc<RoomManager>,
    presence: Arc<Mutex<PresenceRoster>>,
    stats: Arc<RwLock<ConnectionStats>>,
}

pub struct SyncServer {
    config: ServerConfig,
    shared: Shared,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncServer {
    /// Open the configured store (RocksDB when `storage_path` is set).
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store, Arc::new(ShareAuthorizer)))
    }

    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        authorizer: Arc<dyn WriteAuthorizer>,
    ) -> Self {
        let mut gate = VersionGate::new(store, authorizer);
        if let Some(limit) = config.max_content_bytes {
            gate = gate.with_max_content_bytes(limit);
        }
        let shared = Shared {
            gate: Arc::new(gate),
            rooms: Arc::new(RoomManager::new(config.broadcast_capacity)),
            presence: Arc::new(Mutex::new(PresenceRoster::new(config.presence_ttl))),
            stats: Arc::new(RwLock::new(ConnectionStats::default())),
        };
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            shared,
            shutdown_tx,
        }
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self::with_store(
            ServerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(ShareAuthorizer),
        )
    }

    /// Create a document out of band (seeding, admin tooling).
    pub fn create_document(&self, owner: &str, content: Vec<u8>) -> Result<DocumentRecord, GateError> {
        self.shared.gate.create(Some(owner), content)
    }

    pub fn grant_share(
        &self,
        owner: &str,
        document_id: Uuid,
        user_id: &str,
        level: ShareLevel,
    ) -> Result<(), GateError> {
        self.shared
            .gate
            .grant_share(Some(owner), document_id, user_id, level)
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener until the listener
    /// fails or [`shutdown`](Self::shutdown) is called.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        let sweeper = self.spawn_presence_sweeper();

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => {
                    log::info!("Sync server on {} shutting down", self.config.bind_addr);
                    break Ok(());
                }
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared, shutdown).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        sweeper.abort();
        result
    }

    /// Stop accepting and drop every open connection. Stored documents are
    /// untouched; a new server over the same store picks up where this one
    /// left off.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn spawn_presence_sweeper(&self) -> JoinHandle<()> {
        let presence = self.shared.presence.clone();
        let period = self.config.presence_sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                presence.lock().await.sweep(unix_millis());
            }
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Shared,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Replies and forwarded updates share one outbound queue.
        let (out_tx, mut out_rx) = mpsc::channel::<Arc<Vec<u8>>>(256);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_sender
                    .send(Message::Binary(frame.to_vec().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let mut conn = Connection {
            id: Uuid::new_v4(),
            identity: None,
            forwarders: HashMap::new(),
            out_tx,
            shared,
        };

        loop {
            let msg = tokio::select! {
                msg = ws_receiver.next() => msg,
                _ = shutdown.changed() => {
                    log::info!("Dropping connection from {addr} on shutdown");
                    break;
                }
            };
            let Some(msg) = msg else { break };
            match msg {
                Ok(Message::Binary(data)) => {
                    {
                        let mut s = conn.shared.stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += data.len() as u64;
                    }
                    match ClientMessage::decode(&data) {
                        Ok(client_msg) => {
                            if !conn.handle(client_msg).await {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                    }
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
                _ => {}
            }
        }

        conn.disconnect().await;
        writer.abort();
        conn.shared.stats.write().await.active_connections -= 1;
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        let conn = self.shared.stats.read().await;
        let gate = self.shared.gate.stats();
        ServerStats {
            total_connections: conn.total_connections,
            active_connections: conn.active_connections,
            total_messages: conn.total_messages,
            total_bytes: conn.total_bytes,
            writes_accepted: gate.accepted,
            write_conflicts: gate.conflicts,
            writes_rejected: gate.rejected,
            active_rooms: self.shared.rooms.room_count().await,
            presence_records: self.shared.presence.lock().await.len(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn gate(&self) -> &Arc<VersionGate> {
        &self.shared.gate
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.shared.rooms
    }
}

fn map_gate_join_error(e: JoinError) -> GateError {
    GateError::Store(StoreError::Database(format!("gate task failed: {e}")))
}

/// Per-socket state.
struct Connection {
    id: Uuid,
    identity: Option<PeerInfo>,
    /// Document id → task copying that room's updates to this socket.
    forwarders: HashMap<Uuid, JoinHandle<()>>,
    out_tx: mpsc::Sender<Arc<Vec<u8>>>,
    shared: Shared,
}

impl Connection {
    fn caller(&self) -> Option<&str> {
        self.identity.as_ref().map(|p| p.user_id.as_str())
    }

    /// Run a gate call on the blocking pool; RocksDB reads and fsyncs must
    /// not stall the runtime.
    async fn on_gate<T, F>(&self, f: F) -> Result<T, GateError>
    where
        T: Send + 'static,
        F: FnOnce(&VersionGate, Option<&str>) -> Result<T, GateError> + Send + 'static,
    {
        let gate = self.shared.gate.clone();
        let caller = self.caller().map(str::to_string);
        tokio::task::spawn_blocking(move || f(&*gate, caller.as_deref()))
            .await
            .map_err(map_gate_join_error)?
    }

    /// Returns false once the socket can no longer be written.
    async fn reply(&self, msg: ServerMessage) -> bool {
        match msg.encode() {
            Ok(encoded) => self.out_tx.send(Arc::new(encoded)).await.is_ok(),
            Err(e) => {
                log::error!("Failed to encode reply: {e}");
                true
            }
        }
    }

    async fn handle(&mut self, msg: ClientMessage) -> bool {
        match msg {
            ClientMessage::Hello(peer) => {
                log::info!("{} ({}) identified on {}", peer.display_name, peer.user_id, self.id);
                self.identity = Some(peer);
                self.reply(ServerMessage::Welcome).await
            }

            ClientMessage::Create { content } => {
                let created = self
                    .on_gate(move |gate, caller| gate.create(caller, content))
                    .await;
                let reply = match created {
                    Ok(record) => ServerMessage::Created {
                        document_id: record.id,
                        version: record.version,
                    },
                    Err(e) => ServerMessage::Error(e.kind()),
                };
                self.reply(reply).await
            }

            ClientMessage::Subscribe { document_id } => self.subscribe(document_id).await,

            ClientMessage::Unsubscribe { document_id } => {
                self.unsubscribe(document_id).await;
                true
            }

            ClientMessage::Write(req) => self.write(req).await,

            ClientMessage::Heartbeat { document_id } => {
                let Some(peer) = self.identity.clone() else {
                    return self.reply(ServerMessage::Error(GateError::Unauthorized.kind())).await;
                };
                self.shared
                    .presence
                    .lock()
                    .await
                    .upsert(document_id, &peer, unix_millis());
                self.reply(ServerMessage::HeartbeatAck { document_id }).await
            }

            ClientMessage::RosterRequest { document_id } => {
                if self.identity.is_none() {
                    return self.reply(ServerMessage::Error(GateError::Unauthorized.kind())).await;
                }
                let entries = self
                    .shared
                    .presence
                    .lock()
                    .await
                    .roster(document_id, unix_millis());
                self.reply(ServerMessage::Roster {
                    document_id,
                    entries,
                })
                .await
            }

            ClientMessage::Leave { document_id } => {
                if let Some(user_id) = self.caller().map(str::to_string) {
                    self.shared.presence.lock().await.leave(document_id, &user_id);
                }
                true
            }

            ClientMessage::Ping => self.reply(ServerMessage::Pong).await,
        }
    }

    async fn subscribe(&mut self, document_id: Uuid) -> bool {
        let Some(peer) = self.identity.clone() else {
            return self.reply(ServerMessage::Error(GateError::Unauthorized.kind())).await;
        };

        // Join the room before reading so no accepted write falls in between.
        let room = self.shared.rooms.get_or_create(document_id).await;
        let mut rx = room.subscribe(self.id, peer).await;

        let read = self
            .on_gate(move |gate, caller| gate.read(caller, document_id))
            .await;
        let snapshot = match read {
            Ok(snapshot) => snapshot,
            Err(e) => {
                room.unsubscribe(&self.id).await;
                self.shared.rooms.remove_if_empty(&document_id).await;
                return self.reply(ServerMessage::Error(e.kind())).await;
            }
        };

        let out_tx = self.out_tx.clone();
        let conn_id = self.id;
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if out_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Connection {conn_id} lagged by {n} updates on {document_id}");
                        room.record_lag(n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.forwarders.insert(document_id, forwarder) {
            previous.abort();
        }

        log::debug!("Connection {} subscribed to {document_id} at v{}", self.id, snapshot.version);
        self.reply(ServerMessage::Snapshot(snapshot)).await
    }

    async fn unsubscribe(&mut self, document_id: Uuid) {
        if let Some(forwarder) = self.forwarders.remove(&document_id) {
            forwarder.abort();
        }
        if let Some(room) = self.shared.rooms.get(&document_id).await {
            room.unsubscribe(&self.id).await;
            self.shared.rooms.remove_if_empty(&document_id).await;
        }
    }

    async fn write(&mut self, req: WriteRequest) -> bool {
        let request_id = req.request_id;
        let document_id = req.document_id;
        let response = match self.on_gate(move |gate, caller| gate.write(caller, &req)).await {
            Ok(WriteOutcome::Accepted { version, snapshot }) => {
                self.publish(snapshot).await;
                WriteResponse::Accepted { version }
            }
            Ok(WriteOutcome::Conflict { latest }) => WriteResponse::Conflict { latest },
            Err(e) => {
                match &e {
                    GateError::Store(_) => log::error!("Write to {document_id} failed: {e}"),
                    _ => log::debug!("Write to {document_id} rejected: {e}"),
                }
                WriteResponse::Failed { error: e.kind() }
            }
        };
        self.reply(ServerMessage::WriteResult {
            request_id,
            response,
        })
        .await
    }

    async fn publish(&self, snapshot: DocumentSnapshot) {
        let document_id = snapshot.document_id;
        if let Some(room) = self.shared.rooms.get(&document_id).await {
            match room.publish(snapshot) {
                Ok(n) => log::trace!("Update for {document_id} sent to {n} subscribers"),
                Err(e) => log::error!("Failed to broadcast update for {document_id}: {e}"),
            }
        }
    }

    async fn disconnect(&mut self) {
        let documents: Vec<Uuid> = self.forwarders.keys().copied().collect();
        for document_id in documents {
            self.unsubscribe(document_id).await;
        }
    }
}
