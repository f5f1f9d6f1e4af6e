//! Ephemeral awareness: cursors, selections, who is in the room.
//!
//! Presence is deliberately not a CRDT. Each session's entry is a
//! last-writer-wins blob keyed by session id: whatever update arrives
//! last overwrites the entry. Entries are never persisted and expire
//! when heartbeats stop (default 30 s), so a hard-crashed peer simply
//! fades out.
//!
//! Cursor updates are rate-limited at the source — at most one
//! broadcast per 50 ms — since intermediate positions have no value.
//! Join/leave/selection updates always go out immediately.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use board_core::ShapeId;

use crate::protocol::{ProtocolError, UserProfile};

/// A peer is dropped after this long without any update or heartbeat.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum spacing between cursor broadcasts.
pub const CURSOR_MIN_INTERVAL: Duration = Duration::from_millis(50);

/// How often a client heartbeats (well inside the timeout).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Awareness update carried in protocol Awareness frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessUpdate {
    Join { session_id: Uuid, profile: UserProfile },
    Leave { session_id: Uuid },
    Cursor { session_id: Uuid, x: f32, y: f32 },
    /// Selected shape ids; may reference shapes that no longer exist
    Selection { session_id: Uuid, shapes: Vec<ShapeId> },
    Heartbeat { session_id: Uuid },
}

impl AwarenessUpdate {
    pub fn session_id(&self) -> Uuid {
        match self {
            AwarenessUpdate::Join { session_id, .. }
            | AwarenessUpdate::Leave { session_id }
            | AwarenessUpdate::Cursor { session_id, .. }
            | AwarenessUpdate::Selection { session_id, .. }
            | AwarenessUpdate::Heartbeat { session_id } => *session_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(update)
    }
}

/// One peer's presence as consumers render it.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub session_id: Uuid,
    pub profile: UserProfile,
    pub cursor: Option<(f32, f32)>,
    pub selection: Vec<ShapeId>,
    pub last_seen: Instant,
}

/// LWW presence map for one room.
///
/// Used on both sides: clients track remote peers, the room
/// coordinator tracks everyone and prunes the silent.
pub struct PresenceTable {
    entries: HashMap<Uuid, PresenceEntry>,
    timeout: Duration,
}

impl PresenceTable {
    pub fn new(timeout: Duration) -> Self {
        Self { entries: HashMap::new(), timeout }
    }

    pub fn with_defaults() -> Self {
        Self::new(PRESENCE_TIMEOUT)
    }

    /// Apply an update. Returns false when it was ignorable (an update
    /// for a session we have never seen join).
    pub fn apply(&mut self, update: &AwarenessUpdate) -> bool {
        self.apply_at(update, Instant::now())
    }

    pub fn apply_at(&mut self, update: &AwarenessUpdate, now: Instant) -> bool {
        match update {
            AwarenessUpdate::Join { session_id, profile } => {
                // Last writer wins: a rejoin overwrites the old entry
                self.entries.insert(
                    *session_id,
                    PresenceEntry {
                        session_id: *session_id,
                        profile: profile.clone(),
                        cursor: None,
                        selection: Vec::new(),
                        last_seen: now,
                    },
                );
                true
            }
            AwarenessUpdate::Leave { session_id } => self.entries.remove(session_id).is_some(),
            AwarenessUpdate::Cursor { session_id, x, y } => {
                match self.entries.get_mut(session_id) {
                    Some(entry) => {
                        entry.cursor = Some((*x, *y));
                        entry.last_seen = now;
                        true
                    }
                    None => false,
                }
            }
            AwarenessUpdate::Selection { session_id, shapes } => {
                match self.entries.get_mut(session_id) {
                    Some(entry) => {
                        entry.selection = shapes.clone();
                        entry.last_seen = now;
                        true
                    }
                    None => false,
                }
            }
            AwarenessUpdate::Heartbeat { session_id } => {
                match self.entries.get_mut(session_id) {
                    Some(entry) => {
                        entry.last_seen = now;
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Refresh a session's liveness (piggybacked on protocol pings).
    pub fn touch(&mut self, session_id: Uuid) {
        if let Some(entry) = self.entries.get_mut(&session_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Drop entries whose last activity is older than the timeout.
    /// Returns the expired session ids.
    pub fn prune_expired(&mut self) -> Vec<Uuid> {
        self.prune_expired_at(Instant::now())
    }

    pub fn prune_expired_at(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&PresenceEntry> {
        self.entries.get(session_id)
    }

    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn profiles(&self) -> Vec<UserProfile> {
        self.entries.values().map(|e| e.profile.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Source-side presence state: owns the throttle.
pub struct LocalPresence {
    session_id: Uuid,
    min_interval: Duration,
    last_cursor_sent: Option<Instant>,
}

impl LocalPresence {
    pub fn new(session_id: Uuid) -> Self {
        Self { session_id, min_interval: CURSOR_MIN_INTERVAL, last_cursor_sent: None }
    }

    #[cfg(test)]
    fn with_interval(session_id: Uuid, min_interval: Duration) -> Self {
        Self { session_id, min_interval, last_cursor_sent: None }
    }

    /// Rate-limited cursor update; `None` while inside the interval.
    pub fn cursor(&mut self, x: f32, y: f32) -> Option<AwarenessUpdate> {
        self.cursor_at(x, y, Instant::now())
    }

    fn cursor_at(&mut self, x: f32, y: f32, now: Instant) -> Option<AwarenessUpdate> {
        if let Some(last) = self.last_cursor_sent {
            if now.duration_since(last) < self.min_interval {
                return None;
            }
        }
        self.last_cursor_sent = Some(now);
        Some(AwarenessUpdate::Cursor { session_id: self.session_id, x, y })
    }

    /// Selection changes always broadcast.
    pub fn selection(&self, shapes: Vec<ShapeId>) -> AwarenessUpdate {
        AwarenessUpdate::Selection { session_id: self.session_id, shapes }
    }

    pub fn heartbeat(&self) -> AwarenessUpdate {
        AwarenessUpdate::Heartbeat { session_id: self.session_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(table: &mut PresenceTable, now: Instant) -> Uuid {
        let session = Uuid::new_v4();
        table.apply_at(
            &AwarenessUpdate::Join { session_id: session, profile: UserProfile::new("peer") },
            now,
        );
        session
    }

    #[test]
    fn test_update_roundtrip() {
        let update = AwarenessUpdate::Cursor { session_id: Uuid::new_v4(), x: 10.5, y: -3.0 };
        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_join_then_cursor() {
        let now = Instant::now();
        let mut table = PresenceTable::with_defaults();
        let session = join(&mut table, now);

        assert!(table.apply_at(
            &AwarenessUpdate::Cursor { session_id: session, x: 1.0, y: 2.0 },
            now
        ));
        assert_eq!(table.get(&session).unwrap().cursor, Some((1.0, 2.0)));
    }

    #[test]
    fn test_lww_overwrite() {
        let now = Instant::now();
        let mut table = PresenceTable::with_defaults();
        let session = join(&mut table, now);

        table.apply_at(&AwarenessUpdate::Cursor { session_id: session, x: 1.0, y: 1.0 }, now);
        table.apply_at(&AwarenessUpdate::Cursor { session_id: session, x: 9.0, y: 9.0 }, now);
        // No merge of positions — last one wins outright
        assert_eq!(table.get(&session).unwrap().cursor, Some((9.0, 9.0)));
    }

    #[test]
    fn test_update_before_join_ignored() {
        let mut table = PresenceTable::with_defaults();
        let unknown = Uuid::new_v4();
        assert!(!table.apply(&AwarenessUpdate::Cursor { session_id: unknown, x: 0.0, y: 0.0 }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_leave_removes() {
        let now = Instant::now();
        let mut table = PresenceTable::with_defaults();
        let session = join(&mut table, now);

        assert!(table.apply_at(&AwarenessUpdate::Leave { session_id: session }, now));
        assert!(table.is_empty());
    }

    #[test]
    fn test_heartbeat_timeout() {
        let start = Instant::now();
        let mut table = PresenceTable::new(Duration::from_secs(30));
        let quiet = join(&mut table, start);
        let chatty = join(&mut table, start);

        // 29s in, chatty heartbeats; quiet says nothing
        let later = start + Duration::from_secs(29);
        table.apply_at(&AwarenessUpdate::Heartbeat { session_id: chatty }, later);

        // At 31s, only quiet has crossed the 30s timeout
        let expired = table.prune_expired_at(start + Duration::from_secs(31));
        assert_eq!(expired, vec![quiet]);
        assert!(table.get(&chatty).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_selection_may_dangle() {
        let now = Instant::now();
        let mut table = PresenceTable::with_defaults();
        let session = join(&mut table, now);

        // Ids that reference no live shape are kept as-is
        let ghost = Uuid::new_v4();
        table.apply_at(
            &AwarenessUpdate::Selection { session_id: session, shapes: vec![ghost] },
            now,
        );
        assert_eq!(table.get(&session).unwrap().selection, vec![ghost]);
    }

    #[test]
    fn test_cursor_throttle() {
        let mut local = LocalPresence::with_interval(Uuid::new_v4(), Duration::from_millis(50));
        let t0 = Instant::now();

        assert!(local.cursor_at(0.0, 0.0, t0).is_some());
        // Inside the interval: suppressed
        assert!(local.cursor_at(1.0, 1.0, t0 + Duration::from_millis(10)).is_none());
        assert!(local.cursor_at(2.0, 2.0, t0 + Duration::from_millis(49)).is_none());
        // Interval elapsed
        assert!(local.cursor_at(3.0, 3.0, t0 + Duration::from_millis(50)).is_some());
    }

    #[test]
    fn test_selection_not_throttled() {
        let local = LocalPresence::new(Uuid::new_v4());
        // Selection construction has no rate gate at all
        let a = local.selection(vec![Uuid::new_v4()]);
        let b = local.selection(vec![]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejoin_resets_entry() {
        let now = Instant::now();
        let mut table = PresenceTable::with_defaults();
        let session = join(&mut table, now);
        table.apply_at(&AwarenessUpdate::Cursor { session_id: session, x: 5.0, y: 5.0 }, now);

        // Reconnecting session re-joins: cursor and selection reset
        table.apply_at(
            &AwarenessUpdate::Join { session_id: session, profile: UserProfile::new("again") },
            now,
        );
        let entry = table.get(&session).unwrap();
        assert!(entry.cursor.is_none());
        assert!(entry.selection.is_empty());
    }
}
