//! End-to-end tests: a real server, real WebSocket sessions.

use std::sync::Arc;

use tokio::time::{timeout, Duration};
use uuid::Uuid;

use board_collab::auth::{AllowAll, CredentialVerifier, Principal, StaticTokenVerifier};
use board_collab::client::{ConnectionState, SessionConfig, SessionEvent, SyncSession};
use board_collab::protocol::UserProfile;
use board_collab::relay::RelayHub;
use board_collab::server::{ServerConfig, SyncServer};
use board_collab::storage::{FileStore, LogStore, MemoryStore};
use board_core::{Delta, DeltaOp, Geometry, Lamport, ShapePatch, ShapeRecord};

type Events = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;

async fn start_server(verifier: Arc<dyn CredentialVerifier>) -> SyncServer {
    let config = ServerConfig { bind_addr: "127.0.0.1:0".into(), relay_url: None };
    SyncServer::start(config, Arc::new(MemoryStore::new()), verifier)
        .await
        .expect("server should start")
}

/// Connect a session and drive it until Synced.
async fn join(url: &str, room_id: Uuid, name: &str) -> (SyncSession, Events) {
    let config = SessionConfig::new(url, room_id, UserProfile::new(name));
    let (session, mut events) = SyncSession::new(config);
    session.acquire();
    wait_state(&mut events, ConnectionState::Synced).await;
    (session, events)
}

async fn wait_state(events: &mut Events, want: ConnectionState) {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::StateChanged(state) = event {
                if state == want {
                    return;
                }
            }
        }
        panic!("event stream ended before reaching {want:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

async fn wait_document_update(events: &mut Events) {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::DocumentUpdated(_)) {
                return;
            }
        }
        panic!("event stream ended before a document update");
    })
    .await
    .expect("timed out waiting for a document update");
}

fn rect() -> Geometry {
    Geometry::Rect { x: 10.0, y: 10.0, width: 100.0, height: 50.0 }
}

fn add_delta(time: u64, client: Uuid) -> Delta {
    let shape = ShapeRecord::new(rect());
    Delta::new(Lamport::new(time, client), DeltaOp::Add { shape, order_key: time as f64 })
}

#[tokio::test]
async fn test_two_clients_converge() {
    let server = start_server(Arc::new(AllowAll)).await;
    let room = Uuid::new_v4();

    let (alice, mut alice_events) = join(&server.url(), room, "Alice").await;
    let (bob, mut bob_events) = join(&server.url(), room, "Bob").await;

    // Alice draws; Bob sees it
    let id = alice.create_shape(rect());
    wait_document_update(&mut bob_events).await;
    assert_eq!(bob.shape(id).unwrap().geometry, rect());

    // Bob recolors the same shape; Alice sees it
    bob.update_shape(id, ShapePatch { fill: Some([1.0, 0.0, 0.0, 1.0]), ..Default::default() })
        .unwrap();
    wait_document_update(&mut alice_events).await;
    assert_eq!(alice.shape(id).unwrap().style.fill, [1.0, 0.0, 0.0, 1.0]);

    assert_eq!(alice.layer_order(), bob.layer_order());

    alice.release();
    bob.release();
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let server = start_server(Arc::new(AllowAll)).await;
    let room = Uuid::new_v4();

    let (alice, _alice_events) = join(&server.url(), room, "Alice").await;
    let a = alice.create_shape(rect());
    let b = alice.create_shape(Geometry::Ellipse { cx: 0.0, cy: 0.0, rx: 5.0, ry: 5.0 });
    alice.delete_shape(a).unwrap();

    // Bob joins cold and receives the whole history in the handshake
    let (bob, _bob_events) = join(&server.url(), room, "Bob").await;
    assert_eq!(bob.shape_count(), 1);
    assert!(bob.shape(b).is_some());
    assert!(bob.shape(a).is_none());

    alice.release();
    bob.release();
}

#[tokio::test]
async fn test_offline_edits_replay_on_connect() {
    let server = start_server(Arc::new(AllowAll)).await;
    let room = Uuid::new_v4();

    // Alice edits before ever connecting
    let config = SessionConfig::new(server.url(), room, UserProfile::new("Alice"));
    let (alice, mut alice_events) = SyncSession::new(config);
    let id = alice.create_shape(rect());
    alice
        .update_shape(id, ShapePatch { rotation: Some(0.25), ..Default::default() })
        .unwrap();
    assert_eq!(alice.state(), ConnectionState::Disconnected);

    alice.acquire();
    wait_state(&mut alice_events, ConnectionState::Synced).await;

    // Bob sees the offline work
    let (bob, _bob_events) = join(&server.url(), room, "Bob").await;
    assert_eq!(bob.shape(id).unwrap().rotation, 0.25);

    alice.release();
    bob.release();
}

#[tokio::test]
async fn test_undo_propagates_to_peers() {
    let server = start_server(Arc::new(AllowAll)).await;
    let room = Uuid::new_v4();

    let (alice, _alice_events) = join(&server.url(), room, "Alice").await;
    let (bob, mut bob_events) = join(&server.url(), room, "Bob").await;

    let id = alice.create_shape(rect());
    wait_document_update(&mut bob_events).await;
    assert_eq!(bob.shape_count(), 1);

    alice.commit_undo_step();
    assert!(alice.undo());
    wait_document_update(&mut bob_events).await;
    assert_eq!(bob.shape_count(), 0);

    assert!(alice.redo());
    wait_document_update(&mut bob_events).await;
    assert_eq!(bob.shape(id).unwrap().geometry, rect());

    alice.release();
    bob.release();
}

#[tokio::test]
async fn test_presence_selection_reaches_peer() {
    let server = start_server(Arc::new(AllowAll)).await;
    let room = Uuid::new_v4();

    let (alice, _alice_events) = join(&server.url(), room, "Alice").await;
    let (bob, mut bob_events) = join(&server.url(), room, "Bob").await;

    let id = alice.create_shape(rect());
    alice.set_selection(vec![id]);

    timeout(Duration::from_secs(5), async {
        while let Some(event) = bob_events.recv().await {
            if let SessionEvent::PresenceUpdated(session) = event {
                if session == alice.session_id() {
                    return;
                }
            }
        }
        panic!("event stream ended without presence");
    })
    .await
    .expect("timed out waiting for presence");

    let peers = bob.peers();
    let entry = peers
        .iter()
        .find(|p| p.session_id == alice.session_id())
        .expect("Bob should know Alice");
    assert_eq!(entry.selection, vec![id]);

    alice.release();
    bob.release();
}

#[tokio::test]
async fn test_bad_credential_rejected() {
    let mut verifier = StaticTokenVerifier::new();
    verifier.insert("letmein", Principal { user_id: Uuid::new_v4(), name: "Alice".into() });
    let server = start_server(Arc::new(verifier)).await;
    let room = Uuid::new_v4();

    let config = SessionConfig::new(server.url(), room, UserProfile::new("Mallory"))
        .with_credential("wrong");
    let (session, mut events) = SyncSession::new(config);
    session.acquire();

    timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::AuthFailed(reason) = event {
                assert!(!reason.is_empty());
                return;
            }
        }
        panic!("event stream ended without rejection");
    })
    .await
    .expect("timed out waiting for rejection");

    wait_state(&mut events, ConnectionState::Closed).await;
    assert_eq!(server.stats().connections_rejected, 1);
}

#[tokio::test]
async fn test_good_credential_accepted() {
    let mut verifier = StaticTokenVerifier::new();
    verifier.insert("letmein", Principal { user_id: Uuid::new_v4(), name: "Alice".into() });
    let server = start_server(Arc::new(verifier)).await;
    let room = Uuid::new_v4();

    let config = SessionConfig::new(server.url(), room, UserProfile::new("Alice"))
        .with_credential("letmein");
    let (session, mut events) = SyncSession::new(config);
    session.acquire();
    wait_state(&mut events, ConnectionState::Synced).await;

    session.release();
}

#[tokio::test]
async fn test_room_survives_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let room = Uuid::new_v4();
    let id;

    {
        let store: Arc<dyn LogStore> = Arc::new(FileStore::open(dir.path()).unwrap());
        let config = ServerConfig { bind_addr: "127.0.0.1:0".into(), relay_url: None };
        let server = SyncServer::start(config, Arc::clone(&store), Arc::new(AllowAll))
            .await
            .unwrap();

        let (alice, _events) = join(&server.url(), room, "Alice").await;
        id = alice.create_shape(rect());
        alice.release();

        // The room snapshots when its last session leaves
        let snapshotted = timeout(Duration::from_secs(5), async {
            loop {
                if store.load_snapshot(room).unwrap().is_some() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(snapshotted.is_ok(), "room should snapshot on teardown");
        server.shutdown();
    }

    // A fresh process over the same directory recovers the document
    let store: Arc<dyn LogStore> = Arc::new(FileStore::open(dir.path()).unwrap());
    let config = ServerConfig { bind_addr: "127.0.0.1:0".into(), relay_url: None };
    let server = SyncServer::start(config, store, Arc::new(AllowAll)).await.unwrap();

    let (bob, _events) = join(&server.url(), room, "Bob").await;
    assert_eq!(bob.shape(id).unwrap().geometry, rect());

    bob.release();
}

#[tokio::test]
async fn test_rejoin_repairs_missed_frames() {
    let server = start_server(Arc::new(AllowAll)).await;
    let room = Uuid::new_v4();

    let (alice, mut alice_events) = join(&server.url(), room, "Alice").await;
    let (bob, _bob_events) = join(&server.url(), room, "Bob").await;

    // Alice drops off; everything Bob draws meanwhile is frames she
    // never received.
    alice.release();
    wait_state(&mut alice_events, ConnectionState::Closed).await;

    let a = bob.create_shape(rect());
    let b = bob.create_shape(Geometry::Ellipse { cx: 1.0, cy: 1.0, rx: 2.0, ry: 2.0 });

    // On rejoin her vector tells the room exactly what she lacks
    alice.acquire();
    wait_state(&mut alice_events, ConnectionState::Synced).await;
    timeout(Duration::from_secs(5), async {
        while alice.shape(a).is_none() || alice.shape(b).is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("rejoin should repair the missed frames");
    assert_eq!(alice.shape_count(), 2);

    alice.release();
    bob.release();
}

#[tokio::test]
async fn test_out_of_order_bus_deltas_reach_live_session() {
    let server = start_server(Arc::new(AllowAll)).await;
    let room = Uuid::new_v4();

    let (alice, mut alice_events) = join(&server.url(), room, "Alice").await;
    let handle = server.directory().get(room).await.expect("room is live");

    // One client's deltas arriving newest-first: applying the later
    // stamp first must not swallow the earlier one for connected
    // sessions.
    let client = Uuid::new_v4();
    let late = add_delta(3, client);
    let early = add_delta(1, client);
    assert!(handle.relay_delta(late.clone()).await);
    assert!(handle.relay_delta(early.clone()).await);

    wait_document_update(&mut alice_events).await;
    wait_document_update(&mut alice_events).await;
    assert_eq!(alice.shape_count(), 2);
    assert!(alice.shape(late.op.shape_id()).is_some());
    assert!(alice.shape(early.op.shape_id()).is_some());

    alice.release();
}

#[tokio::test]
async fn test_relay_bridges_two_servers() {
    let hub = RelayHub::bind("127.0.0.1:0").await.unwrap();

    let config_a = ServerConfig { bind_addr: "127.0.0.1:0".into(), relay_url: Some(hub.url()) };
    let config_b = ServerConfig { bind_addr: "127.0.0.1:0".into(), relay_url: Some(hub.url()) };
    let server_a =
        SyncServer::start(config_a, Arc::new(MemoryStore::new()), Arc::new(AllowAll))
            .await
            .unwrap();
    let server_b =
        SyncServer::start(config_b, Arc::new(MemoryStore::new()), Arc::new(AllowAll))
            .await
            .unwrap();

    let room = Uuid::new_v4();
    let (alice, _alice_events) = join(&server_a.url(), room, "Alice").await;
    let (bob, mut bob_events) = join(&server_b.url(), room, "Bob").await;

    // Alice's delta crosses process boundaries through the hub
    let id = alice.create_shape(rect());
    wait_document_update(&mut bob_events).await;
    assert_eq!(bob.shape(id).unwrap().geometry, rect());

    alice.release();
    bob.release();
}
