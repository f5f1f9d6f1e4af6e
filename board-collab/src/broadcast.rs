//! Fan-out to the other sessions in a room.
//!
//! One tokio broadcast channel per room: O(1) send, every session
//! holds an independent receiver that buffers up to `capacity` frames.
//! The sender is never filtered here — skipping your own frames is the
//! receiving loop's job, since only it knows its session id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage, UserProfile};

/// Snapshot of broadcast counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_sessions: usize,
}

/// Fan-out group for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    sessions: Arc<RwLock<HashMap<Uuid, UserProfile>>>,
    capacity: usize,
    /// Lock-free counter on the hot path
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how far a lagging receiver may fall behind
    /// before it starts dropping frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a session and hand it a receiver.
    pub async fn add_session(
        &self,
        session_id: Uuid,
        profile: UserProfile,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id, profile);
        self.sender.subscribe()
    }

    pub async fn remove_session(&self, session_id: &Uuid) -> Option<UserProfile> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id)
    }

    /// Encode and fan out. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn profiles(&self) -> Vec<UserProfile> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Sessions with their ids, as the join handshake lists them.
    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, profile)| PeerInfo { session_id: *id, profile: profile.clone() })
            .collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
