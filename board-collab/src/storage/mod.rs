//! Durable room history: append-only delta log plus compacted snapshots.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 LogStore                     │
//! │                                             │
//! │  Snapshot (LZ4) ◄── delta ◄── delta ◄── δ   │
//! │                                             │
//! │  Compaction: write snapshot, then prune     │
//! │  deltas the snapshot's vector covers.       │
//! │  Append-then-compact — readers never see    │
//! │  a state older than what they saw before.   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The room coordinator is the single writer per room; the trait is
//! shared state only across rooms.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (Log-Structured Storage)

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use uuid::Uuid;

use board_core::{Delta, VersionVector};

/// Storage errors. The coordinator retries persistence with backoff;
/// live broadcast proceeds regardless.
#[derive(Debug, Clone)]
pub enum StorageError {
    Io(String),
    Corrupt(String),
    SerializationError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "Storage I/O error: {e}"),
            StorageError::Corrupt(e) => write!(f, "Storage corruption: {e}"),
            StorageError::SerializationError(e) => write!(f, "Storage serialization error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Opaque append + snapshot service, per room.
pub trait LogStore: Send + Sync {
    /// Append one delta; returns its sequence number in the room log.
    fn append(&self, room_id: Uuid, delta: &Delta) -> Result<u64, StorageError>;

    /// Deltas the given vector does not cover, in log order.
    fn deltas_since(&self, room_id: Uuid, vv: &VersionVector) -> Result<Vec<Delta>, StorageError>;

    /// Number of deltas currently in the room log.
    fn delta_count(&self, room_id: Uuid) -> Result<usize, StorageError>;

    fn save_snapshot(&self, room_id: Uuid, snapshot: &[u8]) -> Result<(), StorageError>;

    fn load_snapshot(&self, room_id: Uuid) -> Result<Option<Vec<u8>>, StorageError>;

    /// Prune deltas covered by `covered` (the snapshot's vector).
    /// Returns how many were removed.
    fn compact(&self, room_id: Uuid, covered: &VersionVector) -> Result<usize, StorageError>;

    /// Rooms with any persisted state.
    fn list_rooms(&self) -> Result<Vec<Uuid>, StorageError>;
}
