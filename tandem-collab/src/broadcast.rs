//! Per-document fan-out of accepted writes.
//!
//! Each document room owns one tokio broadcast channel carrying pre-encoded
//! `ServerMessage::Update` frames. Every subscribed connection holds its own
//! receiver; a receiver that falls more than `capacity` frames behind skips
//! the oldest ones and the skip is counted. Echo filtering is the client's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{DocumentSnapshot, PeerInfo, ProtocolError, ServerMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Subscribers of a single document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connection id → identity of the subscribed caller.
    subscribers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub async fn subscribe(
        &self,
        connection_id: Uuid,
        peer: PeerInfo,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.subscribers.write().await.insert(connection_id, peer);
        self.sender.subscribe()
    }

    pub async fn unsubscribe(&self, connection_id: &Uuid) -> Option<PeerInfo> {
        self.subscribers.write().await.remove(connection_id)
    }

    /// Encode `snapshot` once as an `Update` and push it to every receiver.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, snapshot: DocumentSnapshot) -> Result<usize, ProtocolError> {
        let encoded = ServerMessage::Update(snapshot).encode()?;
        Ok(self.publish_raw(Arc::new(encoded)))
    }

    /// Push an already-encoded frame.
    pub fn publish_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `n` frames.
    pub fn record_lag(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_subscribed(&self, connection_id: &Uuid) -> bool {
        self.subscribers.read().await.contains_key(connection_id)
    }

    pub async fn subscribers(&self) -> Vec<PeerInfo> {
        self.subscribers.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscribers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Document id → broadcast room.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// The room, if anyone ever subscribed and it has not been reclaimed.
    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Drop the room once its last subscriber has gone.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.subscriber_count().await == 0 {
                rooms.remove(doc_id);
                log::debug!("Room {doc_id} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn snapshot(doc: Uuid, version: u64) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: doc,
            content: b"Hello".to_vec(),
            version,
            last_writer_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe() {
        let group = BroadcastGroup::new(16);
        let conn = Uuid::new_v4();

        let _rx = group.subscribe(conn, PeerInfo::new("u1", "Alice")).await;
        assert_eq!(group.subscriber_count().await, 1);
        assert!(group.is_subscribed(&conn).await);

        let removed = group.unsubscribe(&conn).await.unwrap();
        assert_eq!(removed.display_name, "Alice");
        assert!(!group.is_subscribed(&conn).await);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let group = BroadcastGroup::new(16);
        let doc = Uuid::new_v4();

        let mut rx1 = group.subscribe(Uuid::new_v4(), PeerInfo::new("u1", "Alice")).await;
        let mut rx2 = group.subscribe(Uuid::new_v4(), PeerInfo::new("u2", "Bob")).await;

        let count = group.publish(snapshot(doc, 2)).unwrap();
        assert_eq!(count, 2);

        for rx in [&mut rx1, &mut rx2] {
            let frame = rx.recv().await.unwrap();
            match ServerMessage::decode(&frame).unwrap() {
                ServerMessage::Update(snap) => assert_eq!(snap.version, 2),
                other => panic!("Expected update, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_lagging_receiver_skips_oldest() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe(Uuid::new_v4(), PeerInfo::new("u1", "Alice")).await;
        let doc = Uuid::new_v4();

        for v in 2..=5 {
            group.publish(snapshot(doc, v)).unwrap();
        }

        match rx.recv().await {
            Err(RecvError::Lagged(n)) => group.record_lag(n),
            other => panic!("Expected lag, got {other:?}"),
        }
        // Newest frames are still delivered.
        let frame = rx.recv().await.unwrap();
        assert!(matches!(
            ServerMessage::decode(&frame).unwrap(),
            ServerMessage::Update(DocumentSnapshot { version: 4, .. })
        ));

        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 4);
        assert_eq!(stats.messages_dropped, 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.publish_raw(Arc::new(vec![1, 2, 3])), 0);
        assert_eq!(group.capacity(), 4);
    }

    #[tokio::test]
    async fn test_room_manager_reuses_rooms() {
        let manager = RoomManager::new(16);
        let doc = Uuid::new_v4();

        let a = manager.get_or_create(doc).await;
        let b = manager.get_or_create(doc).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.get(&doc).await.is_some());

        manager.get_or_create(Uuid::new_v4()).await;
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.active_documents().await.contains(&doc));
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::new(16);
        let doc = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let room = manager.get_or_create(doc).await;
        let _rx = room.subscribe(conn, PeerInfo::new("u1", "Alice")).await;
        assert!(!manager.remove_if_empty(&doc).await);

        room.unsubscribe(&conn).await;
        assert!(manager.remove_if_empty(&doc).await);
        assert!(manager.get(&doc).await.is_none());
    }
}
