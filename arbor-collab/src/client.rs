//! WebSocket sync client holding a local tree replica.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - The step-1/step-2 handshake in both directions
//! - Local tree mutations forwarded as updates
//! - Awareness publishing and tracking, query-awareness answers
//!
//! Edits made while disconnected stay in the local replica and reach the
//! server through the handshake of the next connection.
//!
//! Events are best effort: when nobody drains the event channel, new events
//! are dropped and counted while the replica keeps syncing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arbor_core::{is_empty_update, TreeDoc, TreeError};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::awareness::{Awareness, AwarenessChanges};
use crate::doc::lock;
use crate::protocol::{handle_sync, Message, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    /// The server's step-2 was applied; the replica has everything the
    /// server had when the connection opened.
    Synced,
    /// Effective change applied from the server.
    RemoteUpdate(Vec<u8>),
    Awareness(AwarenessChanges),
    Disconnected,
}

pub struct SyncClient {
    room: String,
    server_url: String,
    tree: TreeDoc,
    awareness: Arc<Mutex<Awareness>>,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Stops the reader task, which in turn lets the writer close the socket
    shutdown_tx: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    events: EventSender,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

/// Non-blocking side of the event channel.
#[derive(Clone)]
struct EventSender {
    tx: mpsc::Sender<SyncEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    fn emit(&self, event: SyncEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Event channel full, dropping {:?}", event);
            }
            // Nobody listens any more.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self::with_tree(server_url, room, TreeDoc::new())
    }

    pub fn with_tree(server_url: impl Into<String>, room: impl Into<String>, tree: TreeDoc) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let awareness = Awareness::new(tree.client_id());
        Self {
            room: room.into(),
            server_url: server_url.into(),
            tree,
            awareness: Arc::new(Mutex::new(awareness)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            shutdown_tx: None,
            reader: None,
            events: EventSender {
                tx: event_tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            event_rx: Some(event_rx),
        }
    }

    /// Events discarded because the event channel was full.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped.load(Ordering::Relaxed)
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to `{server_url}/{room}` and start the handshake.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if self.reader.is_some() {
            self.disconnect().await;
        }
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room);
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws.split();

        // The writer closes the socket once every sender is gone.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(WsMessage::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let _ = out_tx.send(Message::step1(&self.tree).encode()).await;
        let presence = {
            let awareness = lock(&self.awareness);
            match (awareness.local_id(), awareness.local_state()) {
                (Some(id), Some(_)) => Some(awareness.encode_update(&[id])),
                _ => None,
            }
        };
        if let Some(update) = presence {
            let _ = out_tx.send(Message::Awareness(update).encode()).await;
        }

        *self.state.write().await = ConnectionState::Connected;
        self.events.emit(SyncEvent::Connected);
        log::info!("Connected to {}", url);

        let tree = self.tree.clone();
        let awareness = Arc::clone(&self.awareness);
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let replies = out_tx.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        self.outgoing_tx = Some(out_tx);
        self.shutdown_tx = Some(shutdown_tx);

        self.reader = Some(tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = ws_reader.next() => frame,
                    _ = &mut shutdown_rx => break,
                };
                match frame {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let decoded = Message::decode(&data);
                        match decoded.and_then(|msg| process(&tree, &awareness, msg)) {
                            Ok(Inbound { reply, event }) => {
                                if let Some(reply) = reply {
                                    let _ = replies.send(reply.encode()).await;
                                }
                                if let Some(event) = event {
                                    events.emit(event);
                                }
                            }
                            Err(e) => log::warn!("Dropping frame from server: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }

            drop(replies);
            *state.write().await = ConnectionState::Disconnected;
            events.emit(SyncEvent::Disconnected);
        }));

        Ok(())
    }

    /// Close the connection and wait for the reader to stop. The local
    /// replica is kept.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(());
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                log::warn!("Reader task for room {} failed: {}", self.room, e);
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Run a tree operation on the local replica and send its update.
    pub async fn apply_local<F>(&self, op: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(&TreeDoc) -> Result<Vec<u8>, TreeError>,
    {
        let update = op(&self.tree)?;
        if is_empty_update(&update) {
            return Ok(());
        }
        self.send(Message::update(update)).await
    }

    /// Publish (or with `None`, withdraw) this client's presence.
    pub async fn set_awareness(&self, state: Option<Value>) -> Result<(), ProtocolError> {
        let update = lock(&self.awareness).set_local_state(state);
        match update {
            Some(update) => self.send(Message::Awareness(update)).await,
            None => Ok(()),
        }
    }

    /// Ask the server for everyone's presence.
    pub async fn query_awareness(&self) -> Result<(), ProtocolError> {
        self.send(Message::QueryAwareness).await
    }

    async fn send(&self, msg: Message) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            // Picked up by the next handshake.
            return Ok(());
        }
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(msg.encode())
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Ok(()),
        }
    }

    pub fn tree(&self) -> &TreeDoc {
        &self.tree
    }

    pub fn client_id(&self) -> u64 {
        self.tree.client_id()
    }

    /// Presence of every known client, this one included.
    pub fn awareness_states(&self) -> std::collections::HashMap<u64, Value> {
        lock(&self.awareness).states().clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

struct Inbound {
    reply: Option<Message>,
    event: Option<SyncEvent>,
}

fn process(tree: &TreeDoc, awareness: &Mutex<Awareness>, msg: Message) -> Result<Inbound, ProtocolError> {
    let inbound = match msg {
        Message::Sync(sync) => {
            let synced = matches!(sync, SyncMessage::Step2(_));
            let outcome = handle_sync(tree, &sync)?;
            let event = match (synced, outcome.applied) {
                (true, _) => Some(SyncEvent::Synced),
                (false, Some(update)) => Some(SyncEvent::RemoteUpdate(update)),
                (false, None) => None,
            };
            Inbound {
                reply: outcome.reply.map(Message::Sync),
                event,
            }
        }
        Message::Awareness(update) => {
            let changes = lock(awareness).apply_update(&update);
            Inbound {
                reply: None,
                event: (!changes.is_empty()).then_some(SyncEvent::Awareness(changes)),
            }
        }
        Message::QueryAwareness => Inbound {
            reply: Some(Message::Awareness(lock(awareness).full_update())),
            event: None,
        },
        Message::Auth(reason) => {
            log::warn!("Server sent auth message: {:?}", reason);
            Inbound {
                reply: None,
                event: None,
            }
        }
    };
    Ok(inbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::{AwarenessEntry, AwarenessUpdate};
    use arbor_core::{NodeRecord, GENERIC_KIND};
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("ws://localhost:1234", "room-1");
        assert_eq!(client.room(), "room-1");
        assert_eq!(client.server_url(), "ws://localhost:1234");
        assert_eq!(client.tree().node_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_state() {
        let mut client = SyncClient::new("ws://localhost:1234", "room-1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_offline_edits_stay_local() {
        let client = SyncClient::new("ws://localhost:1234", "room-1");
        client
            .apply_local(|tree| tree.insert_root(NodeRecord::with_id("r", "R", GENERIC_KIND)))
            .await
            .unwrap();
        assert!(client.tree().contains("r"));

        client.set_awareness(Some(json!({"name": "ana"}))).await.unwrap();
        assert_eq!(client.awareness_states().len(), 1);
    }

    #[test]
    fn test_full_event_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(2);
        let events = EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        for _ in 0..5 {
            events.emit(SyncEvent::Connected);
        }
        assert_eq!(events.dropped.load(Ordering::Relaxed), 3);
        assert!(matches!(rx.try_recv(), Ok(SyncEvent::Connected)));

        drop(rx);
        events.emit(SyncEvent::Disconnected);
        assert_eq!(events.dropped.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_harmless() {
        let mut client = SyncClient::new("ws://localhost:1234", "room-1");
        client.disconnect().await;
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.dropped_events(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = SyncClient::new("ws://127.0.0.1:1", "room");
        assert!(matches!(client.connect().await, Err(ProtocolError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_process_answers_step1_and_reports_sync() {
        let server = TreeDoc::new();
        server
            .insert_root(NodeRecord::with_id("r", "R", GENERIC_KIND))
            .unwrap();
        let local = TreeDoc::new();
        let awareness = Mutex::new(Awareness::new(local.client_id()));

        let step1 = process(&local, &awareness, Message::step1(&server)).unwrap();
        assert!(matches!(step1.reply, Some(Message::Sync(SyncMessage::Step2(_)))));
        assert!(step1.event.is_none());

        let step2 = Message::Sync(SyncMessage::Step2(server.diff(&local.state_vector()).unwrap()));
        let synced = process(&local, &awareness, step2).unwrap();
        assert!(matches!(synced.event, Some(SyncEvent::Synced)));
        assert!(local.contains("r"));
    }

    #[test]
    fn test_process_tracks_awareness_and_answers_queries() {
        let local = TreeDoc::new();
        let awareness = Mutex::new(Awareness::new(local.client_id()));
        lock(&awareness).set_local_state(Some(json!({"me": true})));

        let remote = Message::Awareness(AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client: 77,
                clock: 1,
                state: Some(json!({"name": "bo"})),
            }],
        });
        let inbound = process(&local, &awareness, remote).unwrap();
        match inbound.event {
            Some(SyncEvent::Awareness(changes)) => assert_eq!(changes.added, vec![77]),
            other => panic!("expected awareness event, got {other:?}"),
        }

        let answer = process(&local, &awareness, Message::QueryAwareness).unwrap();
        match answer.reply {
            Some(Message::Awareness(update)) => assert_eq!(update.entries.len(), 2),
            other => panic!("expected awareness reply, got {other:?}"),
        }
    }
}
