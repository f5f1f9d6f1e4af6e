//! Binary wire protocol for room synchronization.
//!
//! One persistent WebSocket per (room, client). Every frame is a
//! bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ room_id  │ payload  │
//! │ 1 byte   │ 16 bytes   │ 16 bytes │ variable │
//! └──────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! Handshake: the first client frame must be `Join` (credential +
//! profile + version vector). The server answers `JoinAccepted` with
//! its own vector and exactly the deltas the client is missing, or
//! `AuthRejected` followed by a close with code 4401.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use board_core::{Delta, VersionVector};

/// WebSocket close code for a rejected credential.
pub const CLOSE_AUTH_FAILED: u16 = 4401;

/// WebSocket close code for an internal server error.
pub const CLOSE_INTERNAL: u16 = 1011;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Credential + profile + client version vector
    Join = 1,
    /// Server version vector + missing deltas + current peers
    JoinAccepted = 2,
    /// Credential rejected; connection closes with 4401
    AuthRejected = 3,
    /// Mid-session catch-up request (version vector)
    SyncRequest = 4,
    /// Catch-up response (version vector + missing deltas)
    SyncResponse = 5,
    /// One document delta
    Delta = 6,
    /// Ephemeral presence update
    Awareness = 7,
    /// A session joined the room
    PeerJoined = 8,
    /// A session left the room
    PeerLeft = 9,
    /// Heartbeat ping (doubles as the presence heartbeat)
    Ping = 10,
    /// Heartbeat pong
    Pong = 11,
}

/// Display identity of a user, shared with every peer in the room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA color for cursor/selection rendering
    pub color: [f32; 4],
    pub avatar: Option<String>,
}

impl UserProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an explicit user id; the color is a stable hash of it.
    pub fn with_id(user_id: Uuid, name: impl Into<String>) -> Self {
        let hash = user_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            user_id,
            name: name.into(),
            color: [r, g, b, 1.0],
            avatar: None,
        }
    }
}

/// A session currently in the room, as listed in the join handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub session_id: Uuid,
    pub profile: UserProfile,
}

/// Join handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub credential: String,
    pub profile: UserProfile,
    /// What the client has already seen — drives reconciliation
    pub vv: VersionVector,
}

/// Join acceptance: everything the client needs to reach Synced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAcceptedPayload {
    /// The server's version vector; the client re-sends local deltas
    /// this vector does not cover
    pub server_vv: VersionVector,
    /// Full document state, sent when the client's vector predates
    /// the room's log compaction and deltas alone cannot catch it up
    pub snapshot: Option<Vec<u8>>,
    /// Deltas the client's vector was missing
    pub deltas: Vec<Delta>,
    /// Sessions currently in the room
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRejectedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    pub vv: VersionVector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    pub vv: VersionVector,
    pub deltas: Vec<Delta>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Originating session (server-originated frames use nil)
    pub session_id: Uuid,
    pub room_id: Uuid,
    /// Payload, bincode-encoded per msg_type
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).unwrap_or_default()
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    pub fn join(session_id: Uuid, room_id: Uuid, payload: &JoinPayload) -> Self {
        Self {
            msg_type: MessageType::Join,
            session_id,
            room_id,
            payload: encode_payload(payload),
        }
    }

    pub fn join_accepted(room_id: Uuid, payload: &JoinAcceptedPayload) -> Self {
        Self {
            msg_type: MessageType::JoinAccepted,
            session_id: Uuid::nil(),
            room_id,
            payload: encode_payload(payload),
        }
    }

    pub fn auth_rejected(room_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::AuthRejected,
            session_id: Uuid::nil(),
            room_id,
            payload: encode_payload(&AuthRejectedPayload { reason: reason.into() }),
        }
    }

    pub fn sync_request(session_id: Uuid, room_id: Uuid, vv: VersionVector) -> Self {
        Self {
            msg_type: MessageType::SyncRequest,
            session_id,
            room_id,
            payload: encode_payload(&SyncRequestPayload { vv }),
        }
    }

    pub fn sync_response(room_id: Uuid, payload: &SyncResponsePayload) -> Self {
        Self {
            msg_type: MessageType::SyncResponse,
            session_id: Uuid::nil(),
            room_id,
            payload: encode_payload(payload),
        }
    }

    pub fn delta(session_id: Uuid, room_id: Uuid, delta: &Delta) -> Result<Self, ProtocolError> {
        let payload = delta
            .encode()
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self { msg_type: MessageType::Delta, session_id, room_id, payload })
    }

    /// Awareness frames carry a pre-encoded presence update.
    pub fn awareness(session_id: Uuid, room_id: Uuid, payload: Vec<u8>) -> Self {
        Self { msg_type: MessageType::Awareness, session_id, room_id, payload }
    }

    pub fn peer_joined(session_id: Uuid, room_id: Uuid, profile: &UserProfile) -> Self {
        Self {
            msg_type: MessageType::PeerJoined,
            session_id,
            room_id,
            payload: encode_payload(profile),
        }
    }

    pub fn peer_left(session_id: Uuid, room_id: Uuid) -> Self {
        Self { msg_type: MessageType::PeerLeft, session_id, room_id, payload: Vec::new() }
    }

    pub fn ping(session_id: Uuid, room_id: Uuid) -> Self {
        Self { msg_type: MessageType::Ping, session_id, room_id, payload: Vec::new() }
    }

    pub fn pong(session_id: Uuid, room_id: Uuid) -> Self {
        Self { msg_type: MessageType::Pong, session_id, room_id, payload: Vec::new() }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    // Typed payload accessors. Each checks the message type first so a
    // mislabeled frame fails loudly instead of decoding garbage.

    pub fn join_payload(&self) -> Result<JoinPayload, ProtocolError> {
        self.expect(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    pub fn join_accepted_payload(&self) -> Result<JoinAcceptedPayload, ProtocolError> {
        self.expect(MessageType::JoinAccepted)?;
        decode_payload(&self.payload)
    }

    pub fn auth_rejected_payload(&self) -> Result<AuthRejectedPayload, ProtocolError> {
        self.expect(MessageType::AuthRejected)?;
        decode_payload(&self.payload)
    }

    pub fn sync_request_payload(&self) -> Result<SyncRequestPayload, ProtocolError> {
        self.expect(MessageType::SyncRequest)?;
        decode_payload(&self.payload)
    }

    pub fn sync_response_payload(&self) -> Result<SyncResponsePayload, ProtocolError> {
        self.expect(MessageType::SyncResponse)?;
        decode_payload(&self.payload)
    }

    pub fn delta_payload(&self) -> Result<Delta, ProtocolError> {
        self.expect(MessageType::Delta)?;
        Delta::decode(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn profile_payload(&self) -> Result<UserProfile, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    fn expect(&self, want: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == want {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType)
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use board_core::{DeltaOp, Geometry, Lamport, ShapeRecord};

    fn sample_delta() -> Delta {
        let shape = ShapeRecord::new(Geometry::Rect { x: 0.0, y: 0.0, width: 5.0, height: 5.0 });
        Delta::new(Lamport::new(1, Uuid::new_v4()), DeltaOp::Add { shape, order_key: 1.0 })
    }

    #[test]
    fn test_join_roundtrip() {
        let session = Uuid::new_v4();
        let room = Uuid::new_v4();
        let payload = JoinPayload {
            credential: "token-123".into(),
            profile: UserProfile::new("Alice"),
            vv: VersionVector::new(),
        };

        let msg = SyncMessage::join(session, room, &payload);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.session_id, session);
        assert_eq!(decoded.room_id, room);
        let parsed = decoded.join_payload().unwrap();
        assert_eq!(parsed.credential, "token-123");
        assert_eq!(parsed.profile.name, "Alice");
    }

    #[test]
    fn test_join_accepted_roundtrip() {
        let room = Uuid::new_v4();
        let payload = JoinAcceptedPayload {
            server_vv: VersionVector::new(),
            snapshot: None,
            deltas: vec![sample_delta(), sample_delta()],
            peers: vec![PeerInfo { session_id: Uuid::new_v4(), profile: UserProfile::new("Bob") }],
        };

        let msg = SyncMessage::join_accepted(room, &payload);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        let parsed = decoded.join_accepted_payload().unwrap();

        assert_eq!(parsed.deltas.len(), 2);
        assert_eq!(parsed.peers[0].profile.name, "Bob");
        assert!(decoded.session_id.is_nil());
    }

    #[test]
    fn test_auth_rejected_roundtrip() {
        let msg = SyncMessage::auth_rejected(Uuid::new_v4(), "bad token");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.auth_rejected_payload().unwrap().reason, "bad token");
    }

    #[test]
    fn test_delta_roundtrip() {
        let delta = sample_delta();
        let msg = SyncMessage::delta(Uuid::new_v4(), Uuid::new_v4(), &delta).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.delta_payload().unwrap(), delta);
    }

    #[test]
    fn test_sync_request_response_roundtrip() {
        let session = Uuid::new_v4();
        let room = Uuid::new_v4();
        let mut vv = VersionVector::new();
        vv.observe(&Lamport::new(9, session));

        let req = SyncMessage::sync_request(session, room, vv.clone());
        let decoded = SyncMessage::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.sync_request_payload().unwrap().vv, vv);

        let resp = SyncMessage::sync_response(
            room,
            &SyncResponsePayload { vv: vv.clone(), deltas: vec![sample_delta()] },
        );
        let decoded = SyncMessage::decode(&resp.encode().unwrap()).unwrap();
        let parsed = decoded.sync_response_payload().unwrap();
        assert_eq!(parsed.vv, vv);
        assert_eq!(parsed.deltas.len(), 1);
    }

    #[test]
    fn test_peer_joined_left() {
        let session = Uuid::new_v4();
        let room = Uuid::new_v4();
        let profile = UserProfile::with_id(session, "Carol");

        let joined = SyncMessage::peer_joined(session, room, &profile);
        let decoded = SyncMessage::decode(&joined.encode().unwrap()).unwrap();
        assert_eq!(decoded.profile_payload().unwrap().name, "Carol");

        let left = SyncMessage::peer_left(session, room);
        let decoded = SyncMessage::decode(&left.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::PeerLeft);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_accessor_rejects_wrong_type() {
        let msg = SyncMessage::ping(Uuid::new_v4(), Uuid::new_v4());
        assert!(msg.join_payload().is_err());
        assert!(msg.delta_payload().is_err());
        assert!(msg.profile_payload().is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_profile_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            UserProfile::with_id(id, "a").color,
            UserProfile::with_id(id, "b").color
        );
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::JoinAccepted as u8, 2);
        assert_eq!(MessageType::AuthRejected as u8, 3);
        assert_eq!(MessageType::SyncRequest as u8, 4);
        assert_eq!(MessageType::SyncResponse as u8, 5);
        assert_eq!(MessageType::Delta as u8, 6);
        assert_eq!(MessageType::Awareness as u8, 7);
        assert_eq!(MessageType::PeerJoined as u8, 8);
        assert_eq!(MessageType::PeerLeft as u8, 9);
        assert_eq!(MessageType::Ping as u8, 10);
        assert_eq!(MessageType::Pong as u8, 11);
    }
}
