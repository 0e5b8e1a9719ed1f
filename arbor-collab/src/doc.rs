//! Server-side shared document: one replica, its presence, its listeners.
//!
//! ```text
//!             ┌──────────────── SharedDoc ────────────────┐
//! conn 1 ──►  │ TreeDoc ── effective update ──► group ────┼──► conns ≠ origin
//! conn 2 ──►  │ Awareness ── changes ─────────► group     │
//!             │ conns: ConnId → controlled client ids     │
//!             │ updates: raw update channel ──────────────┼──► persistence, webhook
//!             └───────────────────────────────────────────┘
//! ```
//!
//! Connection bookkeeping and awareness live behind `std::sync::Mutex`es
//! that are never held across an `.await`.
//!
//! Awareness changes go to every connection except the one that sent them.
//! y-websocket servers echo them to the sender as well; a y-protocols peer
//! drops its own echoed entries as stale, so skipping the origin only saves
//! a frame.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arbor_core::{is_empty_update, TreeDoc, TreeError};
use tokio::sync::{broadcast, OnceCell};

use crate::awareness::{Awareness, AwarenessChanges};
use crate::broadcast::{BroadcastGroup, ConnId};
use crate::protocol::{handle_sync, Message, ProtocolError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SharedDoc {
    name: String,
    tree: TreeDoc,
    awareness: Mutex<Awareness>,
    conns: Mutex<HashMap<ConnId, HashSet<u64>>>,
    group: BroadcastGroup,
    updates: broadcast::Sender<Arc<Vec<u8>>>,
    /// Bumped on every attach; lets a scheduled eviction detect that the
    /// document was used again in the meantime.
    epoch: AtomicU64,
    /// Set when stored state failed to load. Such a document never writes
    /// back, so the stored data stays as it was.
    load_failed: AtomicBool,
    pub(crate) ready: OnceCell<()>,
}

impl SharedDoc {
    pub fn new(name: impl Into<String>, tree: TreeDoc, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            tree,
            awareness: Mutex::new(Awareness::relay()),
            conns: Mutex::new(HashMap::new()),
            group: BroadcastGroup::new(capacity),
            updates,
            epoch: AtomicU64::new(0),
            load_failed: AtomicBool::new(false),
            ready: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &TreeDoc {
        &self.tree
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    /// Subscribe to every effective document update, whatever its origin.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.updates.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.initialized()
    }

    pub fn load_failed(&self) -> bool {
        self.load_failed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_load_failed(&self) {
        self.load_failed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    // -- Document changes --------------------------------------------------

    /// Fan an effective update out to every connection except `origin` and
    /// to internal listeners.
    pub fn publish(&self, origin: Option<ConnId>, update: Vec<u8>) {
        if is_empty_update(&update) {
            return;
        }
        let frame = Message::update(update.clone()).encode();
        let _ = self.updates.send(Arc::new(update));
        let reached = self.group.broadcast_raw(origin, frame);
        log::trace!("Room {}: update fanned out to {} receivers", self.name, reached);
    }

    /// Apply a remote update and publish what it changed. Returns whether
    /// the document changed.
    pub fn apply_update(&self, origin: Option<ConnId>, update: &[u8]) -> Result<bool, TreeError> {
        let effective = self.tree.apply_update(update)?;
        let changed = !is_empty_update(&effective);
        self.publish(origin, effective);
        Ok(changed)
    }

    /// Run a server-side tree operation and publish its update.
    pub fn mutate<F>(&self, op: F) -> Result<(), TreeError>
    where
        F: FnOnce(&TreeDoc) -> Result<Vec<u8>, TreeError>,
    {
        let update = op(&self.tree)?;
        self.publish(None, update);
        Ok(())
    }

    // -- Protocol ----------------------------------------------------------

    /// Process one decoded message from `conn`; returns the direct reply.
    pub fn handle(&self, conn: ConnId, msg: Message) -> Result<Option<Message>, ProtocolError> {
        match msg {
            Message::Sync(sync) => {
                let outcome = handle_sync(&self.tree, &sync)?;
                if let Some(update) = outcome.applied {
                    self.publish(Some(conn), update);
                }
                Ok(outcome.reply.map(Message::Sync))
            }
            Message::Awareness(update) => {
                let changes = lock(&self.awareness).apply_update(&update);
                self.record_control(conn, &changes);
                self.broadcast_awareness(Some(conn), &changes);
                Ok(None)
            }
            Message::Auth(reason) => {
                log::debug!(
                    "Room {}: ignoring auth message from connection {} ({:?})",
                    self.name,
                    conn,
                    reason
                );
                Ok(None)
            }
            Message::QueryAwareness => Ok(Some(self.awareness_snapshot())),
        }
    }

    /// Frames a freshly attached connection receives before anything else:
    /// step-1, then the presence snapshot when there is one.
    pub fn initial_messages(&self) -> Vec<Message> {
        let mut messages = vec![Message::step1(&self.tree)];
        let awareness = lock(&self.awareness);
        if !awareness.is_empty() {
            messages.push(Message::Awareness(awareness.full_update()));
        }
        messages
    }

    pub fn awareness_snapshot(&self) -> Message {
        Message::Awareness(lock(&self.awareness).full_update())
    }

    /// Live awareness states, keyed by client id.
    pub fn awareness_states(&self) -> HashMap<u64, serde_json::Value> {
        lock(&self.awareness).states().clone()
    }

    fn record_control(&self, conn: ConnId, changes: &AwarenessChanges) {
        let mut conns = lock(&self.conns);
        if let Some(controlled) = conns.get_mut(&conn) {
            controlled.extend(changes.added.iter().copied());
            for id in &changes.removed {
                controlled.remove(id);
            }
        }
    }

    fn broadcast_awareness(&self, origin: Option<ConnId>, changes: &AwarenessChanges) {
        if changes.is_empty() {
            return;
        }
        let update = lock(&self.awareness).encode_update(&changes.all());
        self.group.broadcast(origin, &Message::Awareness(update));
    }

    // -- Connections -------------------------------------------------------

    /// Register a connection. Callers go through the registry so that
    /// eviction cannot race the attach.
    pub(crate) fn attach(&self, conn: ConnId) {
        lock(&self.conns).entry(conn).or_default();
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a connection, remove the awareness states it controlled and
    /// tell the remaining peers. Returns the number of connections left.
    pub(crate) fn detach(&self, conn: ConnId) -> usize {
        let (controlled, remaining) = {
            let mut conns = lock(&self.conns);
            let controlled = conns.remove(&conn);
            (controlled, conns.len())
        };

        if let Some(controlled) = controlled {
            let ids: Vec<u64> = controlled.into_iter().collect();
            let removed = lock(&self.awareness).remove_states(&ids);
            if !removed.is_empty() {
                log::debug!(
                    "Room {}: connection {} left, clearing awareness {:?}",
                    self.name,
                    conn,
                    removed
                );
                let changes = AwarenessChanges {
                    removed,
                    ..AwarenessChanges::default()
                };
                self.broadcast_awareness(Some(conn), &changes);
            }
        }
        remaining
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.conns).len()
    }

    pub fn has_connection(&self, conn: ConnId) -> bool {
        lock(&self.conns).contains_key(&conn)
    }

    /// Awareness client ids introduced by `conn`.
    pub fn controlled_ids(&self, conn: ConnId) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.conns)
            .get(&conn)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for SharedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDoc")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .finish()
    }
}
