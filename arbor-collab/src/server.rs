//! WebSocket sync server with room-based document routing.
//!
//! ```text
//! Client A ──┐  ws://host/<room>
//!            ├── DocumentRegistry ── SharedDoc(room) ── BroadcastGroup
//! Client B ──┘                          │
//!                                       ├── Persistence (memory / RocksDB)
//!                                       └── Webhook (debounced callbacks)
//! ```
//!
//! The request path of the upgrade names the room. Each accepted socket
//! runs in its own task (see [`crate::connection`]).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::broadcast::ConnId;
use crate::connection::{run_connection, CloseReason, ConnectionConfig};
use crate::persistence::{PersistenceError, RocksPersistence, StoreConfig};
use crate::registry::{DocumentRegistry, RegistryConfig};
use crate::webhook::{Webhook, WebhookConfig, WebhookError};

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub connection: ConnectionConfig,
    pub registry: RegistryConfig,
    /// RocksDB directory (None = documents live in memory only)
    pub persistence_path: Option<PathBuf>,
    pub webhook: Option<WebhookConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            connection: ConnectionConfig::default(),
            registry: RegistryConfig::default(),
            persistence_path: None,
            webhook: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub timed_out_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    refused_connections: AtomicU64,
    timed_out_connections: AtomicU64,
    total_frames: AtomicU64,
    total_bytes: AtomicU64,
}

pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: AtomicServerStats,
    next_conn: AtomicU64,
}

impl SyncServer {
    /// Build a server, opening the store and webhook client it is
    /// configured with.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let mut registry = DocumentRegistry::new(config.registry.clone());
        if let Some(path) = &config.persistence_path {
            let persistence = RocksPersistence::open(StoreConfig::new(path.clone()))?;
            let rooms = persistence.store().list_rooms()?;
            log::info!("Store at {} holds {} rooms", path.display(), rooms.len());
            registry = registry.with_persistence(Arc::new(persistence));
        }
        if let Some(webhook) = &config.webhook {
            log::info!("Change callbacks go to {}", webhook.url);
            registry = registry.with_webhook(Webhook::http(webhook.clone())?);
        }
        Ok(Self::with_registry(config, registry))
    }

    /// Serve a registry assembled by the caller.
    pub fn with_registry(config: ServerConfig, registry: DocumentRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            stats: AtomicServerStats::default(),
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the process ends.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Bind the configured address and serve in the background.
    pub async fn start(self: Arc<Self>) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Sync server listening on {}", addr);
        let handle = tokio::spawn(async move {
            if let Err(e) = self.serve(listener).await {
                log::error!("Sync server stopped: {}", e);
            }
        });
        Ok((addr, handle))
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {}", addr);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.handle_socket(stream, addr).await;
            });
        }
    }

    async fn handle_socket(&self, stream: TcpStream, addr: SocketAddr) {
        let mut room: Option<String> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match room_from_path(request.uri().path()) {
                Some(name) => {
                    room = Some(name);
                    Ok(response)
                }
                None => {
                    let mut refusal = ErrorResponse::new(Some("Invalid room name".to_string()));
                    *refusal.status_mut() = StatusCode::BAD_REQUEST;
                    Err(refusal)
                }
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                self.stats.refused_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Refused WebSocket upgrade from {}: {}", addr, e);
                return;
            }
        };
        let Some(room) = room else {
            return;
        };

        let conn: ConnId = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::debug!("Connection {} from {} for room {}", conn, addr, room);

        let summary = run_connection(
            ws,
            conn,
            &room,
            Arc::clone(&self.registry),
            &self.config.connection,
        )
        .await;

        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        self.stats.total_frames.fetch_add(summary.frames_in, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(summary.bytes_in, Ordering::Relaxed);
        if matches!(summary.reason, CloseReason::Timeout | CloseReason::Stalled) {
            self.stats.timed_out_connections.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            refused_connections: self.stats.refused_connections.load(Ordering::Relaxed),
            timed_out_connections: self.stats.timed_out_connections.load(Ordering::Relaxed),
            total_frames: self.stats.total_frames.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            active_rooms: self.registry.len().await,
        }
    }
}

/// Room named by an upgrade request path. Empty and `null` names are
/// refused.
pub fn room_from_path(path: &str) -> Option<String> {
    let name = path.strip_prefix('/').unwrap_or(path);
    let name = name.split('?').next().unwrap_or_default();
    if name.is_empty() || name == "null" {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_from_path() {
        assert_eq!(room_from_path("/room-1").as_deref(), Some("room-1"));
        assert_eq!(room_from_path("/a/b").as_deref(), Some("a/b"));
        assert_eq!(room_from_path("/room?token=x").as_deref(), Some("room"));
        assert_eq!(room_from_path("/"), None);
        assert_eq!(room_from_path(""), None);
        assert_eq!(room_from_path("/null"), None);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:1234");
        assert!(config.persistence_path.is_none());
        assert!(config.webhook.is_none());
        assert_eq!(config.connection.ping_interval.as_secs(), 30);
    }

    #[tokio::test]
    async fn test_persistent_server_opens_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            persistence_path: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
    }
}
