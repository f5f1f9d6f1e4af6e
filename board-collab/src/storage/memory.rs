//! In-memory log store, the default when no storage path is given.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use board_core::{Delta, VersionVector};

use super::{LogStore, StorageError};

#[derive(Default)]
struct RoomLog {
    next_seq: u64,
    deltas: Vec<Delta>,
    snapshot: Option<Vec<u8>>,
}

/// Volatile store with the same contract as the file-backed one.
pub struct MemoryStore {
    rooms: Mutex<HashMap<Uuid, RoomLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { rooms: Mutex::new(HashMap::new()) }
    }

    fn with_room<T>(&self, room_id: Uuid, f: impl FnOnce(&mut RoomLog) -> T) -> T {
        let mut rooms = self.rooms.lock().expect("memory store lock poisoned");
        f(rooms.entry(room_id).or_default())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryStore {
    fn append(&self, room_id: Uuid, delta: &Delta) -> Result<u64, StorageError> {
        Ok(self.with_room(room_id, |log| {
            let seq = log.next_seq;
            log.next_seq += 1;
            log.deltas.push(delta.clone());
            seq
        }))
    }

    fn deltas_since(&self, room_id: Uuid, vv: &VersionVector) -> Result<Vec<Delta>, StorageError> {
        Ok(self.with_room(room_id, |log| {
            log.deltas
                .iter()
                .filter(|d| !vv.contains(&d.stamp))
                .cloned()
                .collect()
        }))
    }

    fn delta_count(&self, room_id: Uuid) -> Result<usize, StorageError> {
        Ok(self.with_room(room_id, |log| log.deltas.len()))
    }

    fn save_snapshot(&self, room_id: Uuid, snapshot: &[u8]) -> Result<(), StorageError> {
        self.with_room(room_id, |log| log.snapshot = Some(snapshot.to_vec()));
        Ok(())
    }

    fn load_snapshot(&self, room_id: Uuid) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.with_room(room_id, |log| log.snapshot.clone()))
    }

    fn compact(&self, room_id: Uuid, covered: &VersionVector) -> Result<usize, StorageError> {
        Ok(self.with_room(room_id, |log| {
            let before = log.deltas.len();
            log.deltas.retain(|d| !covered.contains(&d.stamp));
            before - log.deltas.len()
        }))
    }

    fn list_rooms(&self) -> Result<Vec<Uuid>, StorageError> {
        let rooms = self.rooms.lock().expect("memory store lock poisoned");
        Ok(rooms
            .iter()
            .filter(|(_, log)| !log.deltas.is_empty() || log.snapshot.is_some())
            .map(|(id, _)| *id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use board_core::{DeltaOp, Geometry, Lamport, ShapeRecord};

    fn delta(time: u64, client: Uuid) -> Delta {
        let shape = ShapeRecord::new(Geometry::Rect { x: 0.0, y: 0.0, width: 1.0, height: 1.0 });
        Delta::new(Lamport::new(time, client), DeltaOp::Add { shape, order_key: 1.0 })
    }

    #[test]
    fn test_append_sequences() {
        let store = MemoryStore::new();
        let room = Uuid::new_v4();
        let client = Uuid::new_v4();

        assert_eq!(store.append(room, &delta(1, client)).unwrap(), 0);
        assert_eq!(store.append(room, &delta(2, client)).unwrap(), 1);
        assert_eq!(store.delta_count(room).unwrap(), 2);
    }

    #[test]
    fn test_deltas_since_filters_by_vector() {
        let store = MemoryStore::new();
        let room = Uuid::new_v4();
        let client = Uuid::new_v4();

        for t in 1..=5 {
            store.append(room, &delta(t, client)).unwrap();
        }

        let mut vv = VersionVector::new();
        vv.observe(&Lamport::new(3, client));

        let missing = store.deltas_since(room, &vv).unwrap();
        assert_eq!(missing.len(), 2);
        assert!(missing.iter().all(|d| d.stamp.time > 3));
    }

    #[test]
    fn test_compact_prunes_covered() {
        let store = MemoryStore::new();
        let room = Uuid::new_v4();
        let client = Uuid::new_v4();

        for t in 1..=4 {
            store.append(room, &delta(t, client)).unwrap();
        }

        let mut covered = VersionVector::new();
        covered.observe(&Lamport::new(2, client));

        assert_eq!(store.compact(room, &covered).unwrap(), 2);
        assert_eq!(store.delta_count(room).unwrap(), 2);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let store = MemoryStore::new();
        let room = Uuid::new_v4();

        assert!(store.load_snapshot(room).unwrap().is_none());
        store.save_snapshot(room, b"snapshot-bytes").unwrap();
        assert_eq!(store.load_snapshot(room).unwrap().unwrap(), b"snapshot-bytes");
    }

    #[test]
    fn test_list_rooms() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.append(a, &delta(1, Uuid::new_v4())).unwrap();
        store.save_snapshot(b, b"s").unwrap();

        let rooms = store.list_rooms().unwrap();
        assert!(rooms.contains(&a));
        assert!(rooms.contains(&b));
    }
}
