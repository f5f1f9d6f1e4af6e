//! Cross-process fan-out.
//!
//! Architecture:
//! ```text
//!   server A ──┐                    ┌── server B
//!              ├──► RelayHub (WS) ◄─┤
//!   server C ──┘    rebroadcasts    └── server D
//! ```
//!
//! When one room is served by several processes, each process runs a
//! [`RelayClient`] against a shared hub. The hub is stateless: every
//! frame a node publishes is rebroadcast to every connected node, and
//! each node skips frames stamped with its own origin.
//!
//! Delivery is at-least-once. Duplicates are harmless (receivers drop
//! deltas their vector already covers) and gaps are healed on
//! reconnect: the node sends a [`RelayMessage::SyncRequest`] per live
//! room, peers answer with the deltas it missed plus their own vector,
//! and the node publishes back whatever the responder lacks. While the
//! hub is unreachable the process keeps serving its local sessions
//! (degraded mode) and drops bus publishes, relying on resync.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use uuid::Uuid;

use board_core::{Delta, VersionVector};

use crate::room::RoomDirectory;

/// Hub-side broadcast buffer per node connection.
const HUB_CHANNEL_CAPACITY: usize = 1024;

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Bus payloads exchanged between server processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayMessage {
    /// A delta one node accepted from a local session.
    Publish { room_id: Uuid, delta: Delta },
    /// Reconnecting node asking peers for what it missed.
    SyncRequest { room_id: Uuid, vv: VersionVector },
    /// Answer to a SyncRequest. `vv` is the responder's vector so the
    /// requester can publish back the responder's gap.
    SyncResponse {
        room_id: Uuid,
        /// Node the response is for
        target: Uuid,
        vv: VersionVector,
        deltas: Vec<Delta>,
    },
}

/// Wire frame: every bus message is stamped with its origin node so
/// receivers can skip their own rebroadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayFrame {
    origin: Uuid,
    msg: RelayMessage,
}

impl RelayFrame {
    fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, RelayError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RelayError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }
}

#[derive(Debug, Clone)]
pub enum RelayError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionFailed(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Relay serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Relay deserialization error: {e}"),
            Self::ConnectionFailed(e) => write!(f, "Relay connection failed: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Stateless rebroadcast hub. Every binary frame from any node goes
/// out to every node, sender included; origin filtering happens at
/// the receiving client.
pub struct RelayHub {
    local_addr: std::net::SocketAddr,
}

impl RelayHub {
    /// Bind and start accepting node connections.
    pub async fn bind(addr: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::ConnectionFailed(e.to_string()))?;
        log::info!("Relay hub listening on {local_addr}");

        let (bus, _) = broadcast::channel::<Arc<Vec<u8>>>(HUB_CHANNEL_CAPACITY);
        tokio::spawn(Self::accept_loop(listener, bus));

        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    async fn accept_loop(listener: TcpListener, bus: broadcast::Sender<Arc<Vec<u8>>>) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    log::error!("Relay hub accept failed: {e}");
                    continue;
                }
            };
            let bus = bus.clone();
            tokio::spawn(async move {
                let ws = match accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        log::warn!("Relay handshake from {peer} failed: {e}");
                        return;
                    }
                };
                log::info!("Relay node connected from {peer}");
                let (mut ws_tx, mut ws_rx) = ws.split();
                let mut bus_rx = bus.subscribe();

                loop {
                    tokio::select! {
                        inbound = ws_rx.next() => {
                            match inbound {
                                Some(Ok(Message::Binary(bytes))) => {
                                    let _ = bus.send(Arc::new(bytes.to_vec()));
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = ws_tx.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    log::warn!("Relay node {peer} errored: {e}");
                                    break;
                                }
                            }
                        }
                        outbound = bus_rx.recv() => {
                            match outbound {
                                Ok(bytes) => {
                                    if ws_tx
                                        .send(Message::Binary(bytes.to_vec().into()))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                }
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    // The hub keeps no history to
                                    // resend from. Drop the connection
                                    // before any newer frame widens the
                                    // hole; the node reconnects and its
                                    // per-room sync requests fetch what
                                    // the bus dropped.
                                    log::warn!(
                                        "Relay node {peer} lagged by {n} frames, \
                                         disconnecting for resync"
                                    );
                                    break;
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }
                }
                log::info!("Relay node {peer} disconnected");
            });
        }
    }
}

/// Events the driver surfaces to the bridge.
#[derive(Debug)]
pub enum RelayEvent {
    /// Connected (or reconnected) to the hub; time to resync.
    Connected,
    /// Hub unreachable; the process runs in degraded local-only mode.
    Disconnected,
    /// A frame from another node.
    Inbound { origin: Uuid, msg: RelayMessage },
}

/// Handle to this process's bus connection.
#[derive(Clone)]
pub struct RelayClient {
    node_id: Uuid,
    outbound: mpsc::UnboundedSender<RelayMessage>,
}

impl RelayClient {
    /// Spawn the driver task. Returns the handle plus the inbound
    /// event stream for [`run_relay_bridge`].
    pub fn spawn(url: String) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let node_id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(url, node_id, outbound_rx, event_tx));
        (Self { node_id, outbound: outbound_tx }, event_rx)
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Queue a message for the bus.
    pub fn send(&self, msg: RelayMessage) {
        let _ = self.outbound.send(msg);
    }

    /// Sender for room coordinators to publish through.
    pub fn publisher(&self) -> mpsc::UnboundedSender<RelayMessage> {
        self.outbound.clone()
    }
}

/// Exponential backoff with jitter so a hub restart is not greeted by
/// every node at once.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(RECONNECT_CAP);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    capped + Duration::from_millis(u64::from(nanos % 250))
}

async fn drive(
    url: String,
    node_id: Uuid,
    mut outbound: mpsc::UnboundedReceiver<RelayMessage>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        let ws = match connect_async(&url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("Relay connect to {url} failed (attempt {attempt}): {e}");
                if events.send(RelayEvent::Disconnected).is_err() {
                    return;
                }
                // Degraded mode: publishes queued meanwhile are stale
                // by reconnect time; resync covers them.
                while outbound.try_recv().is_ok() {}
                tokio::time::sleep(backoff_delay(attempt)).await;
                attempt = attempt.saturating_add(1);
                continue;
            }
        };
        attempt = 0;
        log::info!("Relay connected to {url} as node {node_id}");
        if events.send(RelayEvent::Connected).is_err() {
            return;
        }

        let (mut ws_tx, mut ws_rx) = ws.split();
        loop {
            tokio::select! {
                msg = outbound.recv() => {
                    let Some(msg) = msg else { return };
                    let frame = RelayFrame { origin: node_id, msg };
                    let bytes = match frame.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::error!("Relay encode failed: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(bytes))) => {
                            match RelayFrame::decode(&bytes) {
                                // Own rebroadcasts come back; drop them
                                Ok(frame) if frame.origin == node_id => {}
                                Ok(frame) => {
                                    let event = RelayEvent::Inbound {
                                        origin: frame.origin,
                                        msg: frame.msg,
                                    };
                                    if events.send(event).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => log::warn!("Relay frame undecodable: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("Relay stream error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        if events.send(RelayEvent::Disconnected).is_err() {
            return;
        }
        tokio::time::sleep(backoff_delay(attempt)).await;
        attempt = attempt.saturating_add(1);
    }
}

/// Routes bus events into local rooms. Run as a task next to the
/// accept loop.
pub async fn run_relay_bridge(
    directory: Arc<RoomDirectory>,
    client: RelayClient,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            RelayEvent::Connected => {
                // Ask peers for everything each live room missed
                for room_id in directory.active_rooms().await {
                    if let Some(handle) = directory.get(room_id).await {
                        if let Some(vv) = handle.version_vector().await {
                            client.send(RelayMessage::SyncRequest { room_id, vv });
                        }
                    }
                }
            }
            RelayEvent::Disconnected => {
                log::warn!("Relay down; serving local sessions only");
            }
            RelayEvent::Inbound { origin, msg } => match msg {
                RelayMessage::Publish { room_id, delta } => {
                    deliver_to_room(&directory, room_id, delta).await;
                }
                RelayMessage::SyncRequest { room_id, vv } => {
                    // Only rooms live here answer; an idle node has
                    // nothing fresher than what others will send.
                    if let Some(handle) = directory.get(room_id).await {
                        if let Some(resp) = handle.sync_request(vv).await {
                            client.send(RelayMessage::SyncResponse {
                                room_id,
                                target: origin,
                                vv: resp.vv,
                                deltas: resp.deltas,
                            });
                        }
                    }
                }
                RelayMessage::SyncResponse { room_id, target, vv, deltas } => {
                    for delta in deltas {
                        deliver_to_room(&directory, room_id, delta).await;
                    }
                    // The requester pushes back the responder's gap so
                    // catch-up works in both directions.
                    if target == client.node_id() {
                        let handle = directory.get_or_create(room_id).await;
                        if let Some(resp) = handle.sync_request(vv).await {
                            for delta in resp.deltas {
                                client.send(RelayMessage::Publish { room_id, delta });
                            }
                        }
                    }
                }
            },
        }
    }
}

/// Hand a bus delta to its room. The coordinator can idle out between
/// the directory lookup and the mailbox send; one retry through the
/// directory respawns it instead of losing the delta.
async fn deliver_to_room(directory: &RoomDirectory, room_id: Uuid, delta: Delta) {
    let handle = directory.get_or_create(room_id).await;
    if handle.relay_delta(delta.clone()).await {
        return;
    }
    let handle = directory.get_or_create(room_id).await;
    if !handle.relay_delta(delta).await {
        log::warn!("Room {room_id}: relay delta dropped, coordinator unavailable");
    }
}
