use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Persistence, PersistenceError};
use crate::doc::{lock, SharedDoc};

/// Keeps the last flushed state of every room in process memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a room with an encoded update before it is first opened.
    pub fn insert(&self, name: impl Into<String>, state: Vec<u8>) {
        lock(&self.snapshots).insert(name.into(), state);
    }

    pub fn snapshot(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.snapshots).get(name).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.snapshots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.snapshots).is_empty()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn bind_state(&self, name: &str, doc: &SharedDoc) -> Result<(), PersistenceError> {
        if let Some(state) = self.snapshot(name) {
            doc.tree().apply_update(&state)?;
            log::debug!("Room {}: restored {} bytes from memory", name, state.len());
        }
        Ok(())
    }

    async fn write_state(&self, name: &str, doc: &SharedDoc) -> Result<(), PersistenceError> {
        self.insert(name, doc.tree().full_state());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{NodeRecord, TreeDoc, GENERIC_KIND};

    #[tokio::test]
    async fn test_write_then_bind_restores_tree() {
        let store = MemoryPersistence::new();
        let doc = SharedDoc::new("room", TreeDoc::new(), 8);
        doc.tree()
            .insert_root(NodeRecord::with_id("root", "Root", GENERIC_KIND))
            .unwrap();
        store.write_state("room", &doc).await.unwrap();
        assert_eq!(store.len(), 1);

        let fresh = SharedDoc::new("room", TreeDoc::new(), 8);
        store.bind_state("room", &fresh).await.unwrap();
        assert_eq!(fresh.tree().snapshot(), doc.tree().snapshot());
    }

    #[tokio::test]
    async fn test_bind_unknown_room_is_noop() {
        let store = MemoryPersistence::new();
        let doc = SharedDoc::new("nothing", TreeDoc::new(), 8);
        store.bind_state("nothing", &doc).await.unwrap();
        assert_eq!(doc.tree().node_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let store = MemoryPersistence::new();
        store.insert("bad", vec![0xff, 0xff, 0xff]);
        let doc = SharedDoc::new("bad", TreeDoc::new(), 8);
        assert!(matches!(
            store.bind_state("bad", &doc).await,
            Err(PersistenceError::Document(_))
        ));
    }
}
