//! Per-document fan-out to attached connections.
//!
//! Uses a tokio broadcast channel: one pre-encoded frame is shared by all
//! receivers. Each frame carries its originating connection so receivers
//! can skip their own traffic. A receiver that falls more than `capacity`
//! frames behind observes `Lagged` and must resynchronize.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::Message;

/// Identifier of one socket connection, unique per server process.
pub type ConnId = u64;

/// A frame queued for fan-out.
#[derive(Debug)]
pub struct Outbound {
    /// Connection the change came from; `None` for server-side changes.
    pub origin: Option<ConnId>,
    pub frame: Vec<u8>,
}

impl Outbound {
    pub fn is_from(&self, conn: ConnId) -> bool {
        self.origin == Some(conn)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub receivers: usize,
}

/// Lock-free counters updated on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many frames each receiver may buffer before it is
    /// considered lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Outbound>> {
        self.sender.subscribe()
    }

    /// Queue an encoded frame. Returns the number of receivers it reached,
    /// including the origin's own receiver.
    pub fn broadcast_raw(&self, origin: Option<ConnId>, frame: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Outbound { origin, frame }))
            .unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn broadcast(&self, origin: Option<ConnId>, msg: &Message) -> usize {
        self.broadcast_raw(origin, msg.encode())
    }

    /// Record that a receiver skipped `missed` frames.
    pub fn record_lag(&self, missed: u64) {
        self.stats.messages_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
