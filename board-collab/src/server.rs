//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► per-connection task
//!                             │  handshake: /ws/{room} + Join frame
//!                             │  verify credential ── reject ► close 4401
//!                             ▼
//!                        RoomDirectory ──► RoomCoordinator
//!                             │                  │
//!                             ◄── broadcast rx ──┘
//! ```
//!
//! Each connection serves exactly one (session, room) pair. The room
//! id rides in the WebSocket path, the credential in the first frame.
//! After the handshake the connection task is a plain pump: inbound
//! frames go to the room coordinator, the room's broadcast feed goes
//! back out unfiltered (clients drop frames stamped with their own
//! session id).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use uuid::Uuid;

use crate::auth::CredentialVerifier;
use crate::presence::AwarenessUpdate;
use crate::protocol::{
    JoinAcceptedPayload, MessageType, SyncMessage, CLOSE_AUTH_FAILED, CLOSE_INTERNAL,
};
use crate::relay::{run_relay_bridge, RelayClient};
use crate::room::{RoomDirectory, RoomHandle};
use crate::storage::LogStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:9100` (port 0 picks one)
    pub bind_addr: String,
    /// Relay hub url for multi-process fan-out; `None` runs standalone
    pub relay_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1:9100".into(), relay_url: None }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "Bind failed: {e}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Process-wide connection counters.
#[derive(Default)]
struct StatsInner {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicUsize,
}

/// Snapshot of server counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub active_connections: usize,
}

/// A running server.
pub struct SyncServer {
    local_addr: std::net::SocketAddr,
    directory: Arc<RoomDirectory>,
    stats: Arc<StatsInner>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    /// Bind, recover persisted rooms lazily, and start accepting.
    pub async fn start(
        config: ServerConfig,
        store: Arc<dyn LogStore>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind(e.to_string()))?;

        // Rooms recover on first join; just report what storage holds.
        match store.list_rooms() {
            Ok(rooms) => log::info!(
                "Listening on {local_addr}, {} persisted rooms available",
                rooms.len()
            ),
            Err(e) => log::warn!("Listening on {local_addr}, storage scan failed: {e}"),
        }

        let directory = match &config.relay_url {
            Some(url) => {
                let (relay, events) = RelayClient::spawn(url.clone());
                let directory =
                    Arc::new(RoomDirectory::new(store, Some(relay.publisher())));
                tokio::spawn(run_relay_bridge(Arc::clone(&directory), relay, events));
                directory
            }
            None => Arc::new(RoomDirectory::new(store, None)),
        };

        let stats = Arc::new(StatsInner::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&directory),
            verifier,
            Arc::clone(&stats),
            shutdown_rx,
        ));

        Ok(Self { local_addr, directory, stats, shutdown })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Base url clients pass to [`SessionConfig`].
    ///
    /// [`SessionConfig`]: crate::client::SessionConfig
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            connections_accepted: self.stats.accepted.load(Ordering::Relaxed),
            connections_rejected: self.stats.rejected.load(Ordering::Relaxed),
            active_connections: self.stats.active.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting. Existing connections drain on their own.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    directory: Arc<RoomDirectory>,
    verifier: Arc<dyn CredentialVerifier>,
    stats: Arc<StatsInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            },
            _ = shutdown.changed() => {
                log::info!("Server stopped accepting connections");
                return;
            }
        };

        let directory = Arc::clone(&directory);
        let verifier = Arc::clone(&verifier);
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            stats.active.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = serve_connection(stream, peer, directory, verifier, &stats).await {
                log::debug!("Connection from {peer} ended: {e}");
            }
            stats.active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

/// The room id rides in the request path: `/ws/{uuid}`.
fn parse_room_path(path: &str) -> Option<Uuid> {
    let id = path.strip_prefix("/ws/")?;
    Uuid::parse_str(id).ok()
}

fn bad_request(reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

async fn close_with(
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) {
    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.to_string().into() };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
}

async fn serve_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    directory: Arc<RoomDirectory>,
    verifier: Arc<dyn CredentialVerifier>,
    stats: &StatsInner,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut room_id: Option<Uuid> = None;
    let callback = |req: &Request, resp: Response| match parse_room_path(req.uri().path()) {
        Some(id) => {
            room_id = Some(id);
            Ok(resp)
        }
        None => Err(bad_request("expected path /ws/{room_id}")),
    };
    let ws = accept_hdr_async(stream, callback).await?;
    let Some(room_id) = room_id else {
        return Err("no room id captured".into());
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    // First frame must be Join
    let join_msg = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Binary(bytes))) => break SyncMessage::decode(&bytes)?,
            Some(Ok(Message::Ping(data))) => {
                ws_tx.send(Message::Pong(data)).await?;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };
    if join_msg.msg_type != MessageType::Join || join_msg.room_id != room_id {
        stats.rejected.fetch_add(1, Ordering::Relaxed);
        close_with(&mut ws_tx, CLOSE_INTERNAL, "expected a join frame").await;
        return Ok(());
    }
    let session_id = join_msg.session_id;
    let join = join_msg.join_payload()?;

    // Credential check before the room learns anything about us
    let principal = match verifier.verify(room_id, &join.credential) {
        Ok(principal) => principal,
        Err(e) => {
            log::warn!("Session {session_id} from {peer} rejected for room {room_id}: {e}");
            stats.rejected.fetch_add(1, Ordering::Relaxed);
            let rejected = SyncMessage::auth_rejected(room_id, e.to_string());
            if let Ok(bytes) = rejected.encode() {
                let _ = ws_tx.send(Message::Binary(bytes.into())).await;
            }
            close_with(&mut ws_tx, CLOSE_AUTH_FAILED, "credential rejected").await;
            return Ok(());
        }
    };
    log::info!(
        "Session {session_id} ({}) joined room {room_id} from {peer}",
        principal.name
    );
    stats.accepted.fetch_add(1, Ordering::Relaxed);

    // Admit; one retry covers the race with a room that idled out
    let room = directory.get_or_create(room_id).await;
    let mut reply = room.join(session_id, join.profile.clone(), join.vv.clone()).await;
    let room = if reply.is_some() {
        room
    } else {
        let room = directory.get_or_create(room_id).await;
        reply = room.join(session_id, join.profile.clone(), join.vv.clone()).await;
        room
    };
    let Some(reply) = reply else {
        close_with(&mut ws_tx, CLOSE_INTERNAL, "room unavailable").await;
        return Ok(());
    };
    let mut broadcast_rx = reply.receiver;

    let accepted = SyncMessage::join_accepted(
        room_id,
        &JoinAcceptedPayload {
            server_vv: reply.server_vv,
            snapshot: reply.snapshot,
            deltas: reply.deltas,
            peers: reply.peers,
        },
    );
    ws_tx.send(Message::Binary(accepted.encode()?.into())).await?;

    let result = pump(&mut ws_tx, &mut ws_rx, &room, session_id, &mut broadcast_rx).await;
    room.leave(session_id).await;
    log::info!("Session {session_id} left room {room_id}");
    result
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// Post-handshake frame pump.
async fn pump(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    room: &RoomHandle,
    session_id: Uuid,
    broadcast_rx: &mut tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        let msg = match SyncMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Session {session_id}: undecodable frame: {e}");
                                continue;
                            }
                        };
                        handle_inbound(ws_tx, room, session_id, msg, &bytes).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_tx.send(Message::Pong(data)).await?;
                        room.touch(session_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
            outbound = broadcast_rx.recv() => {
                match outbound {
                    Ok(bytes) => {
                        // Zero-copy pass-through; the client skips its
                        // own frames by session id
                        ws_tx.send(Message::Binary(bytes.to_vec().into())).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // The dropped frames are gone and the client's
                        // version vector cannot name them. Recycle the
                        // connection before any newer frame widens the
                        // hole; the rejoin handshake resends everything
                        // past the client's vector from the log.
                        log::warn!("Session {session_id} lagged by {n} frames, closing for resync");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(());
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

async fn handle_inbound(
    ws_tx: &mut WsSink,
    room: &RoomHandle,
    session_id: Uuid,
    msg: SyncMessage,
    raw: &[u8],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match msg.msg_type {
        MessageType::Delta => {
            let delta = match msg.delta_payload() {
                Ok(delta) => delta,
                Err(e) => {
                    log::warn!("Session {session_id}: bad delta: {e}");
                    return Ok(());
                }
            };
            room.delta(session_id, delta, Arc::new(raw.to_vec())).await;
        }
        MessageType::Awareness => {
            match AwarenessUpdate::decode(&msg.payload) {
                Ok(update) => room.awareness(update, Arc::new(raw.to_vec())).await,
                Err(e) => log::warn!("Session {session_id}: bad awareness: {e}"),
            }
        }
        MessageType::SyncRequest => {
            let payload = match msg.sync_request_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("Session {session_id}: bad sync request: {e}");
                    return Ok(());
                }
            };
            if let Some(resp) = room.sync_request(payload.vv).await {
                let frame = SyncMessage::sync_response(msg.room_id, &resp);
                ws_tx.send(Message::Binary(frame.encode()?.into())).await?;
            }
        }
        MessageType::Ping => {
            room.touch(session_id).await;
            let pong = SyncMessage::pong(session_id, msg.room_id);
            ws_tx.send(Message::Binary(pong.encode()?.into())).await?;
        }
        // A second Join, or server-only types from a confused client
        other => log::debug!("Session {session_id}: ignoring {other:?} frame"),
    }
    Ok(())
}
