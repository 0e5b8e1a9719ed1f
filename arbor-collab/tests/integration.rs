//! End-to-end tests: a real server on a loopback port, real clients.

use std::sync::Arc;
use std::time::Duration;

use arbor_collab::{
    AwarenessEntry, AwarenessUpdate, ConnectionConfig, ConnectionState, DecodeErrorPolicy, DocumentStore,
    Message, RegistryConfig, ServerConfig, StoreConfig, SyncClient, SyncEvent, SyncMessage,
    SyncServer,
};
use arbor_core::{NodeRecord, TreeDoc, GENERIC_KIND};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        registry: RegistryConfig {
            broadcast_capacity: 256,
            ..RegistryConfig::default()
        },
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> (String, Arc<SyncServer>) {
    let server = Arc::new(SyncServer::new(config).unwrap());
    let (addr, _handle) = Arc::clone(&server).start().await.unwrap();
    (format!("ws://{addr}"), server)
}

async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn connected(url: &str, room: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url, room);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;
    (client, events)
}

type Raw = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn raw(url: &str, room: &str) -> Raw {
    let (ws, _) = tokio_tungstenite::connect_async(format!("{url}/{room}"))
        .await
        .unwrap();
    ws
}

async fn raw_next(ws: &mut Raw) -> Option<Message> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => return Some(Message::decode(&data).unwrap()),
            Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_fresh_replica_receives_existing_tree() {
    let (url, server) = start(test_config()).await;
    let doc = server.registry().get_or_create("library").await;
    doc.mutate(|tree| tree.insert_root(NodeRecord::with_id("root", "Root", GENERIC_KIND)))
        .unwrap();
    doc.mutate(|tree| {
        tree.insert_node(NodeRecord::with_id("ch1", "Chapter 1", GENERIC_KIND), "root", None)
    })
    .unwrap();

    let (client, _events) = connected(&url, "library").await;
    assert_eq!(client.tree().snapshot(), doc.tree().snapshot());
    assert_eq!(client.tree().children("root").unwrap(), vec!["ch1".to_string()]);
    assert_eq!(client.tree().metadata().version.as_deref(), Some("0.0.1"));
}

#[tokio::test]
async fn test_room_1_two_clients_converge() {
    let (url, server) = start(test_config()).await;

    let (alice, _alice_events) = connected(&url, "room-1").await;
    alice
        .apply_local(|tree| tree.insert_root(NodeRecord::with_id("root", "Root", GENERIC_KIND)))
        .await
        .unwrap();

    let (bob, _bob_events) = connected(&url, "room-1").await;
    eventually(|| bob.tree().contains("root")).await;

    // Concurrent inserts under the same parent.
    let a = alice.apply_local(|tree| {
        tree.insert_node(NodeRecord::with_id("a1", "From Alice", GENERIC_KIND), "root", None)
    });
    let b = bob.apply_local(|tree| {
        tree.insert_node(NodeRecord::with_id("b1", "From Bob", GENERIC_KIND), "root", None)
    });
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    eventually(|| alice.tree().node_count() == 3 && bob.tree().node_count() == 3).await;
    assert_eq!(alice.tree().snapshot(), bob.tree().snapshot());
    assert_eq!(alice.tree().children("root").unwrap().len(), 2);

    let doc = server.registry().get("room-1").await.unwrap();
    eventually(|| doc.tree().node_count() == 3).await;
    assert_eq!(doc.tree().snapshot(), alice.tree().snapshot());
    assert_eq!(doc.connection_count(), 2);
}

#[tokio::test]
async fn test_disconnect_closes_the_server_side() {
    let (url, server) = start(test_config()).await;
    let (mut client, mut events) = connected(&url, "bye").await;
    client.set_awareness(Some(json!({"name": "ana"}))).await.unwrap();

    let doc = server.registry().get("bye").await.unwrap();
    eventually(|| doc.awareness_states().contains_key(&client.client_id())).await;
    assert_eq!(doc.connection_count(), 1);

    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected)).await;
    eventually(|| doc.connection_count() == 0).await;
    assert!(doc.awareness_states().is_empty());

    // Edits made meanwhile reach the server on reconnect.
    client
        .apply_local(|tree| tree.insert_root(NodeRecord::with_id("later", "Later", GENERIC_KIND)))
        .await
        .unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced)).await;
    eventually(|| doc.tree().contains("later")).await;
}

#[tokio::test]
async fn test_replica_keeps_syncing_without_event_consumer() {
    let (url, server) = start(test_config()).await;
    let doc = server.registry().get_or_create("busy").await;
    doc.mutate(|tree| tree.insert_root(NodeRecord::with_id("root", "Root", GENERIC_KIND)))
        .unwrap();

    // The event receiver is never taken, let alone drained.
    let mut client = SyncClient::new(&url, "busy");
    client.connect().await.unwrap();
    eventually(|| client.tree().contains("root")).await;

    for i in 0..300 {
        doc.mutate(|tree| {
            tree.insert_node(NodeRecord::with_id(format!("n{i}"), "Node", GENERIC_KIND), "root", None)
        })
        .unwrap();
        tokio::task::yield_now().await;
    }
    eventually(|| client.tree().node_count() == 301).await;
    assert!(client.dropped_events() > 0);
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (url, server) = start(test_config()).await;
    let (a, _ea) = connected(&url, "left").await;
    let (b, _eb) = connected(&url, "right").await;

    a.apply_local(|tree| tree.insert_root(NodeRecord::with_id("l", "Left", GENERIC_KIND)))
        .await
        .unwrap();
    let left = server.registry().get("left").await.unwrap();
    eventually(|| left.tree().contains("l")).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!b.tree().contains("l"));
    assert_eq!(server.registry().names().await, vec!["left".to_string(), "right".to_string()]);
}

#[tokio::test]
async fn test_awareness_cleanup_on_close() {
    let (url, _server) = start(test_config()).await;
    let (observer, mut events) = connected(&url, "presence").await;

    let mut peer = raw(&url, "presence").await;
    raw_next(&mut peer).await; // step-1
    let presence = AwarenessUpdate {
        entries: [5, 9]
            .into_iter()
            .map(|client| AwarenessEntry {
                client,
                clock: 1,
                state: Some(json!({"user": format!("user-{client}")})),
            })
            .collect(),
    };
    peer.send(WsMessage::Binary(Message::Awareness(presence).encode().into()))
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, SyncEvent::Awareness(c) if c.added.len() == 2)).await;
    let states = observer.awareness_states();
    assert!(states.contains_key(&5) && states.contains_key(&9));

    peer.close(None).await.unwrap();
    let removed = wait_for(&mut events, |e| matches!(e, SyncEvent::Awareness(c) if !c.removed.is_empty())).await;
    if let SyncEvent::Awareness(changes) = removed {
        let mut ids = changes.removed.clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![5, 9]);
    }
    let states = observer.awareness_states();
    assert!(!states.contains_key(&5) && !states.contains_key(&9));
}

#[tokio::test]
async fn test_new_peer_gets_presence_snapshot() {
    let (url, _server) = start(test_config()).await;
    let (first, _events) = connected(&url, "snap").await;
    first
        .set_awareness(Some(json!({"name": "ana"})))
        .await
        .unwrap();

    let (second, _events2) = connected(&url, "snap").await;
    let id = first.client_id();
    eventually(|| second.awareness_states().contains_key(&id)).await;
    assert_eq!(second.awareness_states()[&id], json!({"name": "ana"}));
}

#[tokio::test]
async fn test_silent_connection_is_dropped() {
    let mut config = test_config();
    config.connection = ConnectionConfig {
        ping_interval: Duration::from_millis(100),
        ..ConnectionConfig::default()
    };
    let (url, server) = start(config).await;

    // Never polled, so pings go unanswered.
    let _silent = raw(&url, "quiet").await;
    let registry = Arc::clone(server.registry());
    let doc = timeout(WAIT, async {
        loop {
            if let Some(doc) = registry.get("quiet").await {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    eventually(|| doc.connection_count() == 0).await;
    timeout(WAIT, async {
        while server.stats().await.timed_out_connections == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_invalid_room_names_are_refused() {
    let (url, server) = start(test_config()).await;
    assert!(tokio_tungstenite::connect_async(format!("{url}/null")).await.is_err());
    assert!(tokio_tungstenite::connect_async(format!("{url}/")).await.is_err());
    timeout(WAIT, async {
        while server.stats().await.refused_connections < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(server.registry().is_empty().await);
}

#[tokio::test]
async fn test_strict_policy_closes_noisy_connection() {
    let mut config = test_config();
    config.connection.decode_policy = DecodeErrorPolicy::Strict { max_errors: 2 };
    let (url, server) = start(config).await;

    let mut ws = raw(&url, "strict").await;
    raw_next(&mut ws).await;
    for _ in 0..2 {
        ws.send(WsMessage::Binary(vec![0x7fu8].into())).await.unwrap();
    }
    assert!(timeout(WAIT, raw_next(&mut ws)).await.unwrap().is_none());

    let doc = server.registry().get("strict").await.unwrap();
    eventually(|| doc.connection_count() == 0).await;
}

#[tokio::test]
async fn test_lenient_policy_keeps_noisy_connection() {
    let (url, _server) = start(test_config()).await;
    let mut ws = raw(&url, "lenient").await;
    raw_next(&mut ws).await;
    for _ in 0..5 {
        ws.send(WsMessage::Binary(vec![0x7fu8].into())).await.unwrap();
    }
    let local = TreeDoc::new();
    ws.send(WsMessage::Binary(Message::step1(&local).encode().into()))
        .await
        .unwrap();
    match timeout(WAIT, raw_next(&mut ws)).await.unwrap() {
        Some(Message::Sync(SyncMessage::Step2(_))) => {}
        other => panic!("expected step-2, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rocks_flush_and_rehydrate_through_server() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config();
    config.persistence_path = Some(dir.path().to_path_buf());
    let (url, server) = start(config).await;

    {
        let (mut client, mut events) = connected(&url, "durable").await;
        client
            .apply_local(|tree| tree.insert_root(NodeRecord::with_id("root", "Kept", GENERIC_KIND)))
            .await
            .unwrap();
        let doc = server.registry().get("durable").await.unwrap();
        eventually(|| doc.tree().contains("root")).await;
        client.disconnect().await;
        wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected)).await;
        eventually(|| doc.connection_count() == 0).await;
    }

    // Drop the in-memory copy; the next connection hydrates from disk.
    timeout(WAIT, async {
        while !server.registry().evict("durable").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!server.registry().contains("durable").await);

    let (fresh, _events) = connected(&url, "durable").await;
    assert_eq!(fresh.tree().node("root").unwrap().title, "Kept");
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let tree = TreeDoc::new();
    tree.insert_root(NodeRecord::with_id("root", "Root", GENERIC_KIND))
        .unwrap();

    {
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.save_snapshot("room", &tree.full_state()).unwrap();
        store.store_update("room", &tree.set_metadata("treeId", "t-1")).unwrap();
        store.flush().unwrap();
    }

    let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
    let replica = TreeDoc::new();
    replica
        .apply_update(&store.load_snapshot("room").unwrap().unwrap())
        .unwrap();
    for (_, update) in store.load_updates("room").unwrap() {
        replica.apply_update(&update).unwrap();
    }
    assert_eq!(replica.snapshot(), tree.snapshot());
    assert_eq!(store.list_rooms().unwrap(), vec!["room".to_string()]);
}
