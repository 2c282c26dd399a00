//! WebSocket sync client and per-document session driver.
//!
//! ```text
//!  SessionHandle ── Command ──► SessionDriver (one tokio task)
//!       ▲                          │  tokio::select! over
//!       │ watch<SessionView>       │   - commands from the handle
//!       └──────────────────────────┤   - SyncEvents from the socket
//!                                  │   - debounce / flush timeout deadline
//!                                  │   - presence heartbeat / poll / sweep
//!                                  ▼
//!                       EditSession + PresenceTracker
//!                                  │
//!                                  ▼
//!                    SyncClient ── WebSocket ──► SyncServer
//! ```
//!
//! [`SyncClient`] is the raw connection: it speaks `ClientMessage` /
//! `ServerMessage` and owns the reader and writer tasks. Opening a document
//! hands the connection to a [`SessionDriver`].
//!
//! A lost connection leaves the session buffering in `ErrorBackoff`. An
//! explicit retry reconnects, says `Hello` again, re-subscribes and feeds
//! the fresh snapshot to the session, which then resends its buffer.

use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tandem_core::ContentCapability;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::{PresenceConfig, PresenceError, PresenceTracker};
use crate::protocol::{
    unix_millis, ClientMessage, ErrorKind, PeerInfo, ProtocolError, RosterEntry, ServerMessage,
    WriteRequest,
};
use crate::session::{
    EditSession, SaveFailure, SaveStatus, SessionConfig, SessionError, SessionEvent, SessionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Server(ServerMessage),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Presence configuration error: {0}")]
    Presence(#[from] PresenceError),
    #[error("Server error: {0}")]
    Server(ErrorKind),
    #[error("Timed out waiting for the server")]
    Timeout,
    #[error("Connection or session closed")]
    Closed,
}

// ───────────────────────────────────────────────────────────────────
// Raw connection
// ───────────────────────────────────────────────────────────────────

pub struct SyncClient {
    peer_info: PeerInfo,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    reply_timeout: Duration,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_info,
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            reply_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket, spawn the reader and writer tasks and send `Hello`.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.establish(ConnectionState::Connecting).await
    }

    /// Replace a lost connection with a new one. Identifies again but does
    /// not restore subscriptions.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        self.outgoing_tx = None;
        self.establish(ConnectionState::Reconnecting).await
    }

    async fn establish(&mut self, opening: ConnectionState) -> Result<(), ProtocolError> {
        *self.state.write().await = opening;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        self.send(&ClientMessage::Hello(self.peer_info.clone())).await?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if event_tx.send(SyncEvent::Server(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn subscribe(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Subscribe { document_id }).await
    }

    pub async fn unsubscribe(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Unsubscribe { document_id }).await
    }

    pub async fn write(&self, request: WriteRequest) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Write(request)).await
    }

    pub async fn heartbeat(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Heartbeat { document_id }).await
    }

    pub async fn request_roster(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::RosterRequest { document_id }).await
    }

    pub async fn leave(&self, document_id: Uuid) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Leave { document_id }).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Create a document owned by this client's user and wait for its id.
    pub async fn create_document(&mut self, content: Vec<u8>) -> Result<Uuid, ClientError> {
        self.send(&ClientMessage::Create { content }).await?;
        self.await_reply(|msg| match msg {
            ServerMessage::Created { document_id, .. } => Some(Ok(*document_id)),
            ServerMessage::Error(kind) => Some(Err(ClientError::Server(*kind))),
            _ => None,
        })
        .await
    }

    /// Wait for the first server message `pick` recognizes, discarding the
    /// rest. Requires the event receiver to still be owned by the client.
    async fn await_reply<T>(
        &mut self,
        mut pick: impl FnMut(&ServerMessage) -> Option<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let timeout = self.reply_timeout;
        let rx = self.event_rx.as_mut().ok_or(ClientError::Closed)?;

        let wait = async {
            while let Some(event) = rx.recv().await {
                match event {
                    SyncEvent::Server(msg) => {
                        if let Some(result) = pick(&msg) {
                            return result;
                        }
                        log::trace!("Skipping {msg:?} while awaiting reply");
                    }
                    SyncEvent::Disconnected => return Err(ClientError::Closed),
                    SyncEvent::Connected => {}
                }
            }
            Err(ClientError::Closed)
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Subscribe to `document_id`, wait for its snapshot and start a driver
    /// task that owns this connection from now on.
    pub async fn open_document<C: ContentCapability>(
        mut self,
        document_id: Uuid,
        capability: C,
        config: DriverConfig,
    ) -> Result<SessionHandle<C>, ClientError> {
        self.subscribe(document_id).await?;
        let snapshot = self
            .await_reply(|msg| match msg {
                ServerMessage::Snapshot(s) if s.document_id == document_id => Some(Ok(s.clone())),
                ServerMessage::Error(kind) => Some(Err(ClientError::Server(*kind))),
                _ => None,
            })
            .await?;

        let session = EditSession::open(capability, &snapshot, config.session)?;
        let presence = PresenceTracker::new(document_id, config.presence, unix_millis())?;
        let events = self.event_rx.take().ok_or(ClientError::Closed)?;

        log::info!(
            "Opened document {document_id} at v{} as {}",
            snapshot.version,
            self.peer_info.user_id
        );
        Ok(SessionDriver::spawn(self, events, session, presence))
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

// ───────────────────────────────────────────────────────────────────
// Session driver
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct DriverConfig {
    pub session: SessionConfig,
    pub presence: PresenceConfig,
}

/// Observable state of an open document.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView<D> {
    pub content: D,
    pub base_version: u64,
    pub state: SessionState,
    pub save_status: SaveStatus,
    pub pending_ops: usize,
    pub last_failure: Option<SaveFailure>,
    pub roster: Vec<RosterEntry>,
    /// False while the socket is down.
    pub connected: bool,
    /// False once the driver task has stopped.
    pub open: bool,
}

enum Command<C: ContentCapability> {
    Edit(C::Op, oneshot::Sender<Result<(), SessionError>>),
    Replace(C::Doc),
    Retry,
    Close {
        force: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

pub struct SessionDriver<C: ContentCapability> {
    client: SyncClient,
    events: mpsc::Receiver<SyncEvent>,
    commands: mpsc::Receiver<Command<C>>,
    session: EditSession<C>,
    presence: PresenceTracker,
    view_tx: watch::Sender<SessionView<C::Doc>>,
    event_tx: mpsc::Sender<SessionEvent>,
    connected: bool,
}

impl<C: ContentCapability> SessionDriver<C> {
    fn spawn(
        client: SyncClient,
        events: mpsc::Receiver<SyncEvent>,
        session: EditSession<C>,
        presence: PresenceTracker,
    ) -> SessionHandle<C> {
        let (command_tx, commands) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (view_tx, view_rx) = watch::channel(Self::view_of(&session, &presence, true, true));

        let driver = Self {
            client,
            events,
            commands,
            session,
            presence,
            view_tx,
            event_tx,
            connected: true,
        };
        tokio::spawn(driver.run());

        SessionHandle {
            commands: command_tx,
            view: view_rx,
            events: event_rx,
        }
    }

    fn view_of(
        session: &EditSession<C>,
        presence: &PresenceTracker,
        connected: bool,
        open: bool,
    ) -> SessionView<C::Doc> {
        SessionView {
            content: session.content().clone(),
            base_version: session.base_version(),
            state: session.state(),
            save_status: session.save_status(),
            pending_ops: session.pending_ops().len(),
            last_failure: session.last_failure().cloned(),
            roster: presence.roster().to_vec(),
            connected,
            open,
        }
    }

    /// Next wake-up: the session's debounce or flush timeout, or the next
    /// presence timer, whichever is first.
    fn next_wakeup(&self) -> tokio::time::Instant {
        let now_ms = unix_millis();
        let presence_in = Duration::from_millis(self.presence.next_deadline().saturating_sub(now_ms));
        let mut wake = Instant::now() + presence_in;
        if let Some(deadline) = self.session.next_deadline() {
            wake = wake.min(deadline);
        }
        tokio::time::Instant::from_std(wake)
    }

    async fn run(mut self) {
        let document_id = self.session.document_id();
        loop {
            let wake = self.next_wakeup();
            let keep_going = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        log::debug!("Session handle for {document_id} dropped");
                        let _ = self.client.leave(document_id).await;
                        false
                    }
                },
                event = self.events.recv(), if self.connected => match event {
                    Some(SyncEvent::Server(msg)) => self.on_server_message(msg).await,
                    Some(SyncEvent::Connected) => true,
                    Some(SyncEvent::Disconnected) | None => {
                        log::warn!("Connection lost while editing {document_id}");
                        self.connected = false;
                        self.session.on_network_failure("connection lost");
                        true
                    }
                },
                _ = tokio::time::sleep_until(wake) => {
                    self.on_tick().await;
                    true
                }
            };

            self.publish(keep_going);
            if !keep_going {
                break;
            }
        }
        log::info!("Session driver for {document_id} stopped");
    }

    async fn on_command(&mut self, cmd: Command<C>) -> bool {
        let now = Instant::now();
        match cmd {
            Command::Edit(op, reply) => {
                let _ = reply.send(self.session.edit(op, now));
            }
            Command::Replace(doc) => self.session.replace(doc, now),
            Command::Retry if !self.connected => self.reconnect().await,
            Command::Retry => {
                if let Some(req) = self.session.retry(now) {
                    self.send_write(req).await;
                }
            }
            Command::Close { force, reply } => {
                let document_id = self.session.document_id();
                if force {
                    let _ = self.client.leave(document_id).await;
                    let _ = reply.send(Ok(()));
                    return false;
                }
                match self.session.check_close() {
                    Ok(()) => {
                        let _ = self.client.leave(document_id).await;
                        let _ = reply.send(Ok(()));
                        return false;
                    }
                    Err(e) => {
                        // Push the buffer out now so a later close can succeed.
                        if let Some(req) = self.session.flush_now(now) {
                            self.send_write(req).await;
                        }
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
        true
    }

    async fn on_server_message(&mut self, msg: ServerMessage) -> bool {
        let now = Instant::now();
        let document_id = self.session.document_id();
        match msg {
            ServerMessage::WriteResult {
                request_id,
                response,
            } => {
                if let Some(req) = self.session.on_write_response(request_id, response, now) {
                    self.send_write(req).await;
                }
            }
            ServerMessage::Snapshot(snapshot) if snapshot.document_id == document_id => {
                log::info!("Resynced {document_id} at v{}", snapshot.version);
                if let Some(req) = self.session.resync(snapshot, now) {
                    self.send_write(req).await;
                }
            }
            ServerMessage::Update(update) if update.document_id == document_id => {
                let decision = self.session.on_remote_update(update);
                log::trace!("Remote update for {document_id}: {decision:?}");
            }
            ServerMessage::Roster {
                document_id: doc,
                entries,
            } if doc == document_id => {
                self.presence.on_roster(entries, unix_millis());
            }
            ServerMessage::Error(ErrorKind::Unauthorized) => {
                log::error!("Server rejected our identity; closing {document_id}");
                return false;
            }
            ServerMessage::Error(kind) => {
                log::warn!("Server error on {document_id}: {kind}");
            }
            other => log::trace!("Ignoring {other:?}"),
        }
        !self.session.last_failure().is_some_and(SaveFailure::is_fatal)
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.session.check_flush_timeout(now);
        if let Some(req) = self.session.poll_flush(now) {
            self.send_write(req).await;
        }

        for msg in self.presence.poll(unix_millis()) {
            if self.connected {
                if let Err(e) = self.client.send(&msg).await {
                    log::debug!("Presence message not sent: {e}");
                }
            }
        }
    }

    /// New socket, `Hello`, then `Subscribe`. The session resumes when the
    /// snapshot reply arrives.
    async fn reconnect(&mut self) {
        let document_id = self.session.document_id();
        log::info!("Reconnecting to {} for {document_id}", self.client.server_url());
        if let Err(e) = self.client.reconnect().await {
            log::warn!("Reconnect for {document_id} failed: {e}");
            return;
        }
        self.connected = true;
        if let Err(e) = self.client.subscribe(document_id).await {
            log::warn!("Re-subscribe to {document_id} failed: {e}");
        }
    }

    async fn send_write(&mut self, req: WriteRequest) {
        if !self.connected {
            self.session.on_network_failure("not connected");
            return;
        }
        if let Err(e) = self.client.write(req).await {
            self.session.on_network_failure(e.to_string());
        }
    }

    fn publish(&mut self, open: bool) {
        for event in self.session.take_events() {
            if self.event_tx.try_send(event).is_err() {
                log::trace!("Session event dropped: receiver full or gone");
            }
        }
        let view = Self::view_of(&self.session, &self.presence, self.connected, open);
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Application-facing handle to an open document.
pub struct SessionHandle<C: ContentCapability> {
    commands: mpsc::Sender<Command<C>>,
    view: watch::Receiver<SessionView<C::Doc>>,
    events: mpsc::Receiver<SessionEvent>,
}

impl<C: ContentCapability> SessionHandle<C> {
    pub async fn edit(&self, op: C::Op) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Edit(op, tx))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)??;
        Ok(())
    }

    pub async fn replace(&self, doc: C::Doc) -> Result<(), ClientError> {
        self.commands
            .send(Command::Replace(doc))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Leave `ErrorBackoff`. Reconnects first if the connection was lost.
    pub async fn retry(&self) -> Result<(), ClientError> {
        self.commands
            .send(Command::Retry)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Close if everything is saved. Otherwise flushes immediately and
    /// returns `UnsavedChanges`; call again once saved.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.send_close(false).await
    }

    /// Close and discard anything unsaved.
    pub async fn force_close(&self) -> Result<(), ClientError> {
        self.send_close(true).await
    }

    async fn send_close(&self, force: bool) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Close { force, reply })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)??;
        Ok(())
    }

    pub fn view(&self) -> SessionView<C::Doc> {
        self.view.borrow().clone()
    }

    pub fn content(&self) -> C::Doc {
        self.view.borrow().content.clone()
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.view.borrow().roster.clone()
    }

    /// Wait until the view satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&SessionView<C::Doc>) -> bool,
    ) -> Result<SessionView<C::Doc>, ClientError> {
        let view = self
            .view
            .wait_for(predicate)
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(view.clone())
    }

    /// Next session event (content replaced, ops dropped, save failures).
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new(PeerInfo::new("u1", "Alice"), "ws://localhost:9090");
        assert_eq!(client.peer_info().display_name, "Alice");
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(PeerInfo::new("u1", "Alice"), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = SyncClient::new(PeerInfo::new("u1", "Alice"), "ws://localhost:9090");
        assert_eq!(client.ping().await, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(PeerInfo::new("u1", "Alice"), format!("ws://127.0.0.1:{port}"));
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_refused_leaves_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = SyncClient::new(PeerInfo::new("u1", "Alice"), format!("ws://127.0.0.1:{port}"));
        assert!(client.reconnect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.ping().await, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(PeerInfo::new("u1", "Alice"), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_create_without_receiver_is_closed() {
        let mut client = SyncClient::new(PeerInfo::new("u1", "Alice"), "ws://localhost:9090");
        client.take_event_rx();
        // Sending fails first: there is no connection either.
        assert!(matches!(
            client.create_document(Vec::new()).await,
            Err(ClientError::Protocol(ProtocolError::ConnectionClosed))
        ));
    }
}
