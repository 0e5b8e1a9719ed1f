//! Persistence collaborators for shared documents.
//!
//! ```text
//! ┌─────────────┐  bind_state (create)   ┌──────────────────┐
//! │ Registry    │ ─────────────────────► │ Persistence      │
//! │             │  write_state (idle,    │  ├─ Memory       │
//! │             │   before eviction)     │  └─ RocksDB      │
//! └─────────────┘ ─────────────────────► └──────────────────┘
//! ```
//!
//! Errors are returned to the registry, which logs them. Nothing retries.

pub mod memory;
pub mod rocks;

pub use memory::MemoryPersistence;
pub use rocks::{DocumentMetadata, DocumentStore, RocksPersistence, StoreConfig};

use arbor_core::TreeError;
use async_trait::async_trait;
use thiserror::Error;

use crate::doc::SharedDoc;

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Hydrate a freshly created document and start tracking its changes.
    async fn bind_state(&self, name: &str, doc: &SharedDoc) -> Result<(), PersistenceError>;

    /// Flush the document's current state.
    async fn write_state(&self, name: &str, doc: &SharedDoc) -> Result<(), PersistenceError>;
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Room name of {0} bytes is too long to store")]
    NameTooLong(usize),

    #[error("Column family '{0}' not found")]
    MissingColumnFamily(&'static str),

    #[error("Stored state could not be applied: {0}")]
    Document(#[from] TreeError),
}
