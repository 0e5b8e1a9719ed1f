//! # arbor-collab: Real-time synchronization of Arbor trees
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer               │
//! │ (replica)   │   sync protocol    │  └─ DocumentRegistry     │
//! └──────┬──────┘                    │      └─ SharedDoc/room   │
//!        │                           └──────┬───────────────────┘
//!        ▼                                  │
//! ┌─────────────┐                    ┌──────┴───────┐  ┌──────────────┐
//! │ TreeDoc     │                    │ BroadcastGroup│  │ Persistence  │
//! │ (local)     │                    │ (fan-out)     │  │ Webhook      │
//! └─────────────┘                    └──────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: sync / awareness / auth / query-awareness messages on
//!   the lib0 codec from `yrs::encoding`
//! - [`awareness`]: ephemeral presence with per-client clocks
//! - [`broadcast`]: per-document fan-out
//! - [`doc`]: the server-side shared document
//! - [`registry`]: room name → shared document, lifecycle
//! - [`connection`]: per-socket loop with heartbeat
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`persistence`]: storage collaborators (memory, RocksDB)
//! - [`webhook`]: debounced change callbacks

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod connection;
pub mod doc;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod webhook;

pub use awareness::{Awareness, AwarenessChanges, AwarenessEntry, AwarenessUpdate};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnId, Outbound};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use connection::{CloseReason, ConnectionConfig, ConnectionSummary, DecodeErrorPolicy};
pub use doc::SharedDoc;
pub use persistence::{
    DocumentMetadata, DocumentStore, MemoryPersistence, Persistence, PersistenceError,
    RocksPersistence, StoreConfig,
};
pub use protocol::{handle_sync, Message, MessageKind, ProtocolError, SyncMessage};
pub use registry::{
    ContentInitializer, DocumentRegistry, MetadataInitializer, RegistryConfig, INITIAL_VERSION,
};
pub use server::{room_from_path, ServerConfig, ServerError, ServerStats, SyncServer};
pub use webhook::{CallbackPayload, CallbackSink, HttpSink, Webhook, WebhookConfig, WebhookError};
