//! Credential verification at the room boundary.
//!
//! The engine does not issue or manage credentials — it only calls a
//! verifier before any document traffic flows. A rejected credential
//! closes the socket with code 4401 and is never retried with the
//! same credential.

use std::collections::HashMap;

use uuid::Uuid;

/// Verified identity behind a credential.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub user_id: Uuid,
    pub name: String,
}

/// Authentication failures. All are fatal for the session.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    InvalidCredential,
    Expired,
    /// Credential is valid but not for this room
    NotAuthorized,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredential => write!(f, "Invalid credential"),
            AuthError::Expired => write!(f, "Credential expired"),
            AuthError::NotAuthorized => write!(f, "Not authorized for this room"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Pluggable credential check, called once per Join.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, room_id: Uuid, credential: &str) -> Result<Principal, AuthError>;
}

/// Accepts anything. For local development and tests.
pub struct AllowAll;

impl CredentialVerifier for AllowAll {
    fn verify(&self, _room_id: Uuid, _credential: &str) -> Result<Principal, AuthError> {
        Ok(Principal { user_id: Uuid::new_v4(), name: "anonymous".into() })
    }
}

/// Fixed token → principal table, optionally scoped per room.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Principal>,
    /// Rooms a token may join; empty = any room
    room_scope: HashMap<String, Vec<Uuid>>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self { tokens: HashMap::new(), room_scope: HashMap::new() }
    }

    pub fn insert(&mut self, token: impl Into<String>, principal: Principal) {
        self.tokens.insert(token.into(), principal);
    }

    pub fn scope_to_room(&mut self, token: impl Into<String>, room_id: Uuid) {
        self.room_scope.entry(token.into()).or_default().push(room_id);
    }
}

impl Default for StaticTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialVerifier for StaticTokenVerifier {
    fn verify(&self, room_id: Uuid, credential: &str) -> Result<Principal, AuthError> {
        let principal = self
            .tokens
            .get(credential)
            .cloned()
            .ok_or(AuthError::InvalidCredential)?;
        if let Some(rooms) = self.room_scope.get(credential) {
            if !rooms.contains(&room_id) {
                return Err(AuthError::NotAuthorized);
            }
        }
        Ok(principal)
    }
}
