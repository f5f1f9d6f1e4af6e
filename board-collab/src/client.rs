//! Client session: a local document kept in sync with a room.
//!
//! Lifecycle:
//! ```text
//! Disconnected ─► Connecting ─► Authenticating ─► Reconciling ─► Synced
//!                     ▲                                            │
//!                     │ backoff + jitter                           │ drop
//!                     └──────────── Reconnecting ◄─────────────────┘
//! ```
//!
//! Every local edit applies to the in-memory [`DocumentStore`] first —
//! the UI never waits on the network — and the resulting delta is
//! queued in a bounded outbox. While `Synced`, queued deltas go out
//! immediately; offline they wait, and on (re)join the server's vector
//! tells us exactly which outbox entries it never saw.
//!
//! The session is reference-counted: views call [`SyncSession::acquire`]
//! when they start rendering a board and [`SyncSession::release`] when
//! they stop. The first acquire spawns the network driver, the last
//! release shuts it down.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use board_core::{
    field_of, Delta, DocumentStore, FieldId, FieldValue, Geometry, LocalEdit, ShapeId,
    ShapePatch, ShapeRecord, StoreError, UndoTracker, VersionVector,
};

use crate::presence::{
    AwarenessUpdate, LocalPresence, PresenceEntry, PresenceTable, HEARTBEAT_INTERVAL,
};
use crate::protocol::{JoinPayload, MessageType, SyncMessage, UserProfile};

/// Local deltas retained for replay after a reconnect.
const OUTBOX_LIMIT: usize = 1024;

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No driver running (before the first acquire)
    Disconnected,
    /// First connection attempt in flight
    Connecting,
    /// Transport up, waiting on the join handshake
    Authenticating,
    /// Exchanging missed deltas with the server
    Reconciling,
    /// Live: edits flow both ways
    Synced,
    /// Transport lost; retrying with backoff
    Reconnecting,
    /// Terminal: released, or the credential was rejected
    Closed,
}

/// Everything the UI needs to react to.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Remote deltas changed these shapes
    DocumentUpdated(Vec<ShapeId>),
    PeerJoined(UserProfile),
    PeerLeft(Uuid),
    /// A peer's cursor or selection moved
    PresenceUpdated(Uuid),
    /// Terminal; the server refused the credential
    AuthFailed(String),
}

/// Connection parameters for one room.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base server url, e.g. `ws://127.0.0.1:9100`
    pub server_url: String,
    pub room_id: Uuid,
    pub credential: String,
    pub profile: UserProfile,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, room_id: Uuid, profile: UserProfile) -> Self {
        Self {
            server_url: server_url.into(),
            room_id,
            credential: String::new(),
            profile,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }
}

/// State the facade and the driver share.
struct Core {
    store: DocumentStore,
    undo: UndoTracker,
    local_presence: LocalPresence,
    peers: PresenceTable,
    /// Recent local deltas, oldest first; replayed on reconcile
    outbox: VecDeque<Delta>,
}

impl Core {
    fn push_outbox(&mut self, delta: Delta) {
        if self.outbox.len() == OUTBOX_LIMIT {
            // The oldest entry is almost certainly server-covered by now
            self.outbox.pop_front();
        }
        self.outbox.push_back(delta);
    }
}

/// Deltas the server's vector does not cover, oldest first.
fn replay_candidates(outbox: &VecDeque<Delta>, server_vv: &VersionVector) -> Vec<Delta> {
    outbox
        .iter()
        .filter(|d| !server_vv.contains(&d.stamp))
        .cloned()
        .collect()
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(RECONNECT_CAP);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    capped + Duration::from_millis(u64::from(nanos % 250))
}

struct SessionInner {
    config: SessionConfig,
    session_id: Uuid,
    state: Mutex<ConnectionState>,
    core: Mutex<Core>,
    /// Live sender into the driver's socket, present while connected
    net: Mutex<Option<mpsc::UnboundedSender<SyncMessage>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    refs: AtomicUsize,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl SessionInner {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if *state != next {
            *state = next;
            let _ = self.events.send(SessionEvent::StateChanged(next));
        }
    }

    /// Send a frame if connected; the outbox already holds the delta.
    fn try_send(&self, msg: SyncMessage) {
        let net = self.net.lock().expect("session net lock poisoned");
        if let Some(tx) = net.as_ref() {
            let _ = tx.send(msg);
        }
    }

    fn send_deltas(&self, deltas: &[Delta]) {
        for delta in deltas {
            match SyncMessage::delta(self.session_id, self.config.room_id, delta) {
                Ok(msg) => self.try_send(msg),
                Err(e) => log::error!("Delta frame encoding failed: {e}"),
            }
        }
    }
}

/// Handle to one synchronized room document.
pub struct SyncSession {
    inner: Arc<SessionInner>,
}

impl SyncSession {
    /// Build a session. Nothing connects until the first [`acquire`].
    ///
    /// [`acquire`]: SyncSession::acquire
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let session_id = Uuid::new_v4();
        let client_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let core = Core {
            store: DocumentStore::new(client_id),
            undo: UndoTracker::with_defaults(),
            local_presence: LocalPresence::new(session_id),
            peers: PresenceTable::with_defaults(),
            outbox: VecDeque::new(),
        };

        let inner = Arc::new(SessionInner {
            config,
            session_id,
            state: Mutex::new(ConnectionState::Disconnected),
            core: Mutex::new(core),
            net: Mutex::new(None),
            events: events_tx,
            refs: AtomicUsize::new(0),
            shutdown: Mutex::new(None),
        });

        (Self { inner }, events_rx)
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn room_id(&self) -> Uuid {
        self.inner.config.room_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("session state lock poisoned")
    }

    /// A view started using this session. The first acquire spawns
    /// the network driver.
    pub fn acquire(&self) {
        if self.inner.refs.fetch_add(1, Ordering::SeqCst) == 0 {
            let (tx, rx) = watch::channel(false);
            *self.inner.shutdown.lock().expect("session shutdown lock poisoned") = Some(tx);
            tokio::spawn(drive(Arc::clone(&self.inner), rx));
        }
    }

    /// A view stopped using this session. The last release shuts the
    /// driver down and the state goes to `Closed`.
    pub fn release(&self) {
        if self.inner.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            let shutdown = self
                .inner
                .shutdown
                .lock()
                .expect("session shutdown lock poisoned")
                .take();
            if let Some(tx) = shutdown {
                let _ = tx.send(true);
            }
        }
    }

    // ---- document reads ----------------------------------------------

    pub fn shape(&self, id: ShapeId) -> Option<ShapeRecord> {
        self.core().store.get(id)
    }

    /// Alive shapes, bottom to top.
    pub fn shapes(&self) -> Vec<ShapeRecord> {
        self.core().store.shapes_in_order()
    }

    pub fn layer_order(&self) -> Vec<ShapeId> {
        self.core().store.layer_order()
    }

    pub fn shape_count(&self) -> usize {
        self.core().store.len()
    }

    pub fn version_vector(&self) -> VersionVector {
        self.core().store.version_vector().clone()
    }

    // ---- local edits ---------------------------------------------------

    pub fn create_shape(&self, geometry: Geometry) -> ShapeId {
        let delta = {
            let mut core = self.core();
            let (id, delta) = core.store.create_shape(ShapeRecord::new(geometry));
            core.undo.record(LocalEdit::Added(id));
            core.push_outbox(delta.clone());
            delta
        };
        let id = delta.op.shape_id();
        self.inner.send_deltas(&[delta]);
        id
    }

    pub fn update_shape(&self, id: ShapeId, patch: ShapePatch) -> Result<(), StoreError> {
        let deltas = {
            let mut core = self.core();
            let prior = core.store.get(id).ok_or(StoreError::ShapeNotFound(id))?;
            let deltas = core.store.update_shape(id, patch)?;
            for delta in &deltas {
                if let board_core::DeltaOp::Set { field, value, .. } = &delta.op {
                    core.undo.record(LocalEdit::Set {
                        shape: id,
                        field: *field,
                        prior: field_of(&prior, *field),
                        next: value.clone(),
                    });
                }
                core.push_outbox(delta.clone());
            }
            deltas
        };
        self.inner.send_deltas(&deltas);
        Ok(())
    }

    pub fn set_field(&self, id: ShapeId, field: FieldId, value: FieldValue) -> Result<(), StoreError> {
        let delta = {
            let mut core = self.core();
            let prior = core.store.get(id).ok_or(StoreError::ShapeNotFound(id))?;
            let delta = core.store.set_field(id, field, value.clone())?;
            core.undo.record(LocalEdit::Set {
                shape: id,
                field,
                prior: field_of(&prior, field),
                next: value,
            });
            core.push_outbox(delta.clone());
            delta
        };
        self.inner.send_deltas(&[delta]);
        Ok(())
    }

    pub fn delete_shape(&self, id: ShapeId) -> Result<(), StoreError> {
        let delta = {
            let mut core = self.core();
            let delta = core.store.delete_shape(id)?;
            core.undo.record(LocalEdit::Removed(id));
            core.push_outbox(delta.clone());
            delta
        };
        self.inner.send_deltas(&[delta]);
        Ok(())
    }

    pub fn restore_shape(&self, id: ShapeId) -> Result<(), StoreError> {
        let delta = {
            let mut core = self.core();
            let delta = core.store.restore_shape(id)?;
            core.undo.record(LocalEdit::Restored(id));
            core.push_outbox(delta.clone());
            delta
        };
        self.inner.send_deltas(&[delta]);
        Ok(())
    }

    /// Rearrange the layer order to exactly `target`.
    pub fn reorder(&self, target: &[ShapeId]) -> Result<(), StoreError> {
        let deltas = {
            let mut core = self.core();
            let priors: Vec<(ShapeId, Option<f64>)> =
                target.iter().map(|id| (*id, core.store.order_key(id))).collect();
            let deltas = core.store.reorder(target)?;
            for delta in &deltas {
                if let board_core::DeltaOp::Move { shape, order_key } = &delta.op {
                    if let Some((_, Some(prior))) = priors.iter().find(|(id, _)| id == shape) {
                        core.undo.record(LocalEdit::Moved {
                            shape: *shape,
                            prior: *prior,
                            next: *order_key,
                        });
                    }
                }
                core.push_outbox(delta.clone());
            }
            deltas
        };
        self.inner.send_deltas(&deltas);
        Ok(())
    }

    // ---- undo / redo -----------------------------------------------------

    /// Close the open capture window so the next edit starts a fresh
    /// undo step (call when a drag gesture ends).
    pub fn commit_undo_step(&self) {
        self.core().undo.commit_step();
    }

    /// Undo the most recent local step. Returns false when there is
    /// nothing to undo.
    pub fn undo(&self) -> bool {
        let deltas = {
            let mut core = self.core();
            let core = &mut *core;
            let Some(deltas) = core.undo.undo(&mut core.store) else { return false };
            for delta in &deltas {
                core.push_outbox(delta.clone());
            }
            deltas
        };
        self.inner.send_deltas(&deltas);
        true
    }

    pub fn redo(&self) -> bool {
        let deltas = {
            let mut core = self.core();
            let core = &mut *core;
            let Some(deltas) = core.undo.redo(&mut core.store) else { return false };
            for delta in &deltas {
                core.push_outbox(delta.clone());
            }
            deltas
        };
        self.inner.send_deltas(&deltas);
        true
    }

    pub fn can_undo(&self) -> bool {
        self.core().undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.core().undo.can_redo()
    }

    // ---- presence --------------------------------------------------------

    /// Broadcast the local cursor position; silently dropped while
    /// inside the rate-limit interval or offline.
    pub fn cursor(&self, x: f32, y: f32) {
        let update = { self.core().local_presence.cursor(x, y) };
        if let Some(update) = update {
            self.send_awareness(&update);
        }
    }

    pub fn set_selection(&self, shapes: Vec<ShapeId>) {
        let update = { self.core().local_presence.selection(shapes) };
        self.send_awareness(&update);
    }

    /// Remote peers as last seen.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.core().peers.snapshot()
    }

    fn send_awareness(&self, update: &AwarenessUpdate) {
        match update.encode() {
            Ok(bytes) => self.inner.try_send(SyncMessage::awareness(
                self.inner.session_id,
                self.inner.config.room_id,
                bytes,
            )),
            Err(e) => log::error!("Awareness encoding failed: {e}"),
        }
    }

    fn core(&self) -> std::sync::MutexGuard<'_, Core> {
        self.inner.core.lock().expect("session core lock poisoned")
    }
}

// ---- network driver --------------------------------------------------------

async fn drive(inner: Arc<SessionInner>, mut shutdown: watch::Receiver<bool>) {
    let url = format!("{}/ws/{}", inner.config.server_url, inner.config.room_id);
    let mut attempt: u32 = 0;

    loop {
        inner.set_state(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let connect = tokio::select! {
            result = connect_async(&url) => result,
            _ = shutdown.changed() => break,
        };
        let ws = match connect {
            Ok((ws, _)) => ws,
            Err(e) => {
                log::warn!("Connect to {url} failed (attempt {attempt}): {e}");
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(backoff_delay(attempt)) => continue,
                    _ = shutdown.changed() => break,
                }
            }
        };

        match run_connection(&inner, ws, &mut shutdown).await {
            ConnectionOutcome::Shutdown => break,
            ConnectionOutcome::AuthRejected => break,
            ConnectionOutcome::Dropped => {
                *inner.net.lock().expect("session net lock poisoned") = None;
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(backoff_delay(attempt)) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    *inner.net.lock().expect("session net lock poisoned") = None;
    inner.set_state(ConnectionState::Closed);
}

enum ConnectionOutcome {
    /// Clean shutdown requested by release()
    Shutdown,
    /// Terminal: credential refused, no retry
    AuthRejected,
    /// Transport lost; caller reconnects
    Dropped,
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn run_connection(
    inner: &Arc<SessionInner>,
    ws: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionOutcome {
    let (mut ws_tx, mut ws_rx) = ws.split();
    inner.set_state(ConnectionState::Authenticating);

    // Handshake: Join carries what we have; the reply carries the rest.
    let join = {
        let core = inner.core.lock().expect("session core lock poisoned");
        JoinPayload {
            credential: inner.config.credential.clone(),
            profile: inner.config.profile.clone(),
            vv: core.store.version_vector().clone(),
        }
    };
    let frame = SyncMessage::join(inner.session_id, inner.config.room_id, &join);
    let Ok(bytes) = frame.encode() else { return ConnectionOutcome::Dropped };
    if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
        return ConnectionOutcome::Dropped;
    }

    // Wait for the verdict
    let accepted = loop {
        let reply = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = shutdown.changed() => return ConnectionOutcome::Shutdown,
        };
        match reply {
            Some(Ok(Message::Binary(bytes))) => match SyncMessage::decode(&bytes) {
                Ok(msg) if msg.msg_type == MessageType::JoinAccepted => {
                    match msg.join_accepted_payload() {
                        Ok(payload) => break payload,
                        Err(e) => {
                            log::error!("Join reply undecodable: {e}");
                            return ConnectionOutcome::Dropped;
                        }
                    }
                }
                Ok(msg) if msg.msg_type == MessageType::AuthRejected => {
                    let reason = msg
                        .auth_rejected_payload()
                        .map(|p| p.reason)
                        .unwrap_or_else(|_| "credential rejected".into());
                    log::warn!("Join rejected: {reason}");
                    let _ = inner.events.send(SessionEvent::AuthFailed(reason));
                    return ConnectionOutcome::AuthRejected;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Undecodable frame during handshake: {e}"),
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => return ConnectionOutcome::Dropped,
            Some(Ok(_)) => {}
            Some(Err(_)) => return ConnectionOutcome::Dropped,
        }
    };

    // Reconcile: apply what we missed, replay what the server missed.
    inner.set_state(ConnectionState::Reconciling);
    let (changed, replay) = {
        let mut core = inner.core.lock().expect("session core lock poisoned");
        let mut changed: Vec<ShapeId> =
            accepted.deltas.iter().map(|d| d.op.shape_id()).collect();
        if let Some(snapshot) = &accepted.snapshot {
            match core.store.merge_snapshot(snapshot) {
                Ok(touched) => changed.extend(touched),
                Err(e) => log::error!("Join snapshot merge failed: {e}"),
            }
        }
        core.store.apply_batch(&accepted.deltas);
        let replay = replay_candidates(&core.outbox, &accepted.server_vv);

        core.peers.clear();
        for peer in &accepted.peers {
            core.peers.apply(&AwarenessUpdate::Join {
                session_id: peer.session_id,
                profile: peer.profile.clone(),
            });
        }
        (changed, replay)
    };
    if !changed.is_empty() {
        let _ = inner.events.send(SessionEvent::DocumentUpdated(changed));
    }
    log::info!(
        "Joined room {} ({} deltas down, {} up)",
        inner.config.room_id,
        accepted.deltas.len(),
        replay.len()
    );
    for delta in &replay {
        let Ok(msg) = SyncMessage::delta(inner.session_id, inner.config.room_id, delta) else {
            continue;
        };
        let Ok(bytes) = msg.encode() else { continue };
        if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
            return ConnectionOutcome::Dropped;
        }
    }

    // Live: open the facade's path to the socket
    let (net_tx, mut net_rx) = mpsc::unbounded_channel::<SyncMessage>();
    *inner.net.lock().expect("session net lock poisoned") = Some(net_tx);
    inner.set_state(ConnectionState::Synced);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            outbound = net_rx.recv() => {
                let Some(msg) = outbound else { return ConnectionOutcome::Dropped };
                let Ok(bytes) = msg.encode() else { continue };
                if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                    return ConnectionOutcome::Dropped;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Binary(bytes))) => {
                        match SyncMessage::decode(&bytes) {
                            Ok(msg) => handle_frame(inner, msg),
                            Err(e) => log::warn!("Undecodable frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            return ConnectionOutcome::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return ConnectionOutcome::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Stream error: {e}");
                        return ConnectionOutcome::Dropped;
                    }
                }
            }
            _ = heartbeat.tick() => {
                // Presence heartbeat plus a prune of silent peers
                let (update, expired, vv) = {
                    let mut core = inner.core.lock().expect("session core lock poisoned");
                    (
                        core.local_presence.heartbeat(),
                        core.peers.prune_expired(),
                        core.store.version_vector().clone(),
                    )
                };
                for session_id in expired {
                    let _ = inner.events.send(SessionEvent::PeerLeft(session_id));
                }
                if let Ok(bytes) = update.encode() {
                    let frame = SyncMessage::awareness(
                        inner.session_id,
                        inner.config.room_id,
                        bytes,
                    );
                    if let Ok(encoded) = frame.encode() {
                        if ws_tx.send(Message::Binary(encoded.into())).await.is_err() {
                            return ConnectionOutcome::Dropped;
                        }
                    }
                }
                // Periodic catch-up: anything the broadcast path lost
                // comes back in the SyncResponse. Usually empty.
                let request =
                    SyncMessage::sync_request(inner.session_id, inner.config.room_id, vv);
                if let Ok(encoded) = request.encode() {
                    if ws_tx.send(Message::Binary(encoded.into())).await.is_err() {
                        return ConnectionOutcome::Dropped;
                    }
                }
            }
            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return ConnectionOutcome::Shutdown;
            }
        }
    }
}

/// Apply one inbound frame while synced.
fn handle_frame(inner: &Arc<SessionInner>, msg: SyncMessage) {
    // The room fans every frame out to all receivers; drop our own.
    if msg.session_id == inner.session_id {
        return;
    }
    match msg.msg_type {
        MessageType::Delta => match msg.delta_payload() {
            Ok(delta) => {
                let outcome = {
                    let mut core = inner.core.lock().expect("session core lock poisoned");
                    core.store.apply(&delta)
                };
                if outcome.changed() {
                    let _ = inner
                        .events
                        .send(SessionEvent::DocumentUpdated(vec![delta.op.shape_id()]));
                }
            }
            Err(e) => log::warn!("Bad delta frame: {e}"),
        },
        MessageType::SyncResponse => match msg.sync_response_payload() {
            Ok(payload) => {
                let changed: Vec<ShapeId> =
                    payload.deltas.iter().map(|d| d.op.shape_id()).collect();
                let (applied, replay) = {
                    let mut core = inner.core.lock().expect("session core lock poisoned");
                    let applied = core.store.apply_batch(&payload.deltas);
                    // The response carries the server's vector; push
                    // back any outbox entry it still lacks.
                    let replay = replay_candidates(&core.outbox, &payload.vv);
                    (applied, replay)
                };
                if applied > 0 {
                    let _ = inner.events.send(SessionEvent::DocumentUpdated(changed));
                }
                inner.send_deltas(&replay);
            }
            Err(e) => log::warn!("Bad sync response: {e}"),
        },
        MessageType::Awareness => match AwarenessUpdate::decode(&msg.payload) {
            Ok(update) => {
                let session_id = update.session_id();
                let known = {
                    let mut core = inner.core.lock().expect("session core lock poisoned");
                    core.peers.apply(&update)
                };
                if known {
                    let _ = inner.events.send(SessionEvent::PresenceUpdated(session_id));
                }
            }
            Err(e) => log::warn!("Bad awareness frame: {e}"),
        },
        MessageType::PeerJoined => match msg.profile_payload() {
            Ok(profile) => {
                {
                    let mut core = inner.core.lock().expect("session core lock poisoned");
                    core.peers.apply(&AwarenessUpdate::Join {
                        session_id: msg.session_id,
                        profile: profile.clone(),
                    });
                }
                let _ = inner.events.send(SessionEvent::PeerJoined(profile));
            }
            Err(e) => log::warn!("Bad peer-joined frame: {e}"),
        },
        MessageType::PeerLeft => {
            {
                let mut core = inner.core.lock().expect("session core lock poisoned");
                core.peers.apply(&AwarenessUpdate::Leave { session_id: msg.session_id });
            }
            let _ = inner.events.send(SessionEvent::PeerLeft(msg.session_id));
        }
        // Handshake and keepalive types are handled inline in the loop
        _ => {}
    }
}
