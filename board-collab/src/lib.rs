//! # board-collab — Real-time sync layer for shared boards
//!
//! WebSocket-based multiplayer editing over the delta CRDT in
//! `board-core`, with durable room history and optional cross-process
//! fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncSession │ ◄─────────────────► │  SyncServer  │
//! │ (per user)  │    Binary Proto     │              │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                   ┌─────────────────┐
//! │DocumentStore│                   │ RoomCoordinator │
//! │ (replica)   │                   │ (authority)     │
//! └─────────────┘                   └──┬─────┬─────┬──┘
//!                                      │     │     │
//!                              LogStore│ fan-out │relay
//!                            (durable) │(in-proc)│(cross-proc)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`auth`] — Credential verification at the join handshake
//! - [`presence`] — Ephemeral cursors, selections, heartbeats
//! - [`broadcast`] — Per-room fan-out with backpressure
//! - [`storage`] — Append-only delta log + compacted snapshots
//! - [`room`] — Per-room coordinator actor and directory
//! - [`relay`] — Cross-process delta bus (hub + client)
//! - [`server`] — WebSocket sync server
//! - [`client`] — Client session with offline queue and undo/redo

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AllowAll, AuthError, CredentialVerifier, Principal, StaticTokenVerifier};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, SessionConfig, SessionEvent, SyncSession};
pub use presence::{
    AwarenessUpdate, LocalPresence, PresenceEntry, PresenceTable, CURSOR_MIN_INTERVAL,
    HEARTBEAT_INTERVAL, PRESENCE_TIMEOUT,
};
pub use protocol::{
    JoinAcceptedPayload, JoinPayload, MessageType, PeerInfo, ProtocolError, SyncMessage,
    UserProfile, CLOSE_AUTH_FAILED, CLOSE_INTERNAL,
};
pub use relay::{RelayClient, RelayHub, RelayMessage};
pub use room::{RoomDirectory, RoomHandle, RoomStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{FileStore, LogStore, MemoryStore, StorageError};
