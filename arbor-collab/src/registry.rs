//! Registry of live shared documents, keyed by room name.
//!
//! The registry is an ordinary value owned by whoever serves the rooms;
//! tests build as many isolated registries as they like.
//!
//! Lifecycle of a room:
//! 1. First `get_or_create` inserts the document and runs persistence
//!    `bind_state`, then the content initializer, once.
//! 2. Connections `attach` and `detach`.
//! 3. The last `detach` flushes through `write_state`, unless `bind_state`
//!    failed: then the stored data is left alone. With persistence and
//!    an idle timeout configured, an eviction is scheduled that drops the
//!    document if nobody attached in the meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arbor_core::{NodeKindRegistry, TreeDoc, TreeError};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::broadcast::ConnId;
use crate::doc::SharedDoc;
use crate::persistence::Persistence;
use crate::webhook::Webhook;

/// Content version written into fresh documents.
pub const INITIAL_VERSION: &str = "0.0.1";

/// Hook run once per document after it has been hydrated.
#[async_trait]
pub trait ContentInitializer: Send + Sync {
    async fn initialize(&self, doc: &SharedDoc) -> Result<(), TreeError>;
}

/// Stamps the content version into documents that have none.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataInitializer;

#[async_trait]
impl ContentInitializer for MetadataInitializer {
    async fn initialize(&self, doc: &SharedDoc) -> Result<(), TreeError> {
        if doc.tree().metadata().version.is_none() {
            doc.mutate(|tree| Ok(tree.set_metadata("version", INITIAL_VERSION)))?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RegistryConfig {
    /// Garbage-collect tombstones in new documents.
    pub gc: bool,
    /// Frames buffered per connection before it counts as lagging.
    pub broadcast_capacity: usize,
    pub kinds: Arc<NodeKindRegistry>,
    /// Delay between the last detach and eviction. Only honored with
    /// persistence configured.
    pub idle_evict: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            gc: true,
            broadcast_capacity: 1024,
            kinds: Arc::new(NodeKindRegistry::default()),
            idle_evict: None,
        }
    }
}

pub struct DocumentRegistry {
    docs: RwLock<HashMap<String, Arc<SharedDoc>>>,
    config: RegistryConfig,
    persistence: Option<Arc<dyn Persistence>>,
    initializer: Arc<dyn ContentInitializer>,
    webhook: Option<Webhook>,
}

impl DocumentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            config,
            persistence: None,
            initializer: Arc::new(MetadataInitializer),
            webhook: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_initializer(mut self, initializer: Arc<dyn ContentInitializer>) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_webhook(mut self, webhook: Webhook) -> Self {
        self.webhook = Some(webhook);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// The document registered under `name`, created and initialized on
    /// first use. Concurrent callers for a new name all wait for the same
    /// initialization.
    pub async fn get_or_create(&self, name: &str) -> Arc<SharedDoc> {
        let doc = self.lookup_or_insert(name).await;
        self.ensure_ready(&doc).await;
        doc
    }

    async fn lookup_or_insert(&self, name: &str) -> Arc<SharedDoc> {
        if let Some(doc) = self.docs.read().await.get(name) {
            return Arc::clone(doc);
        }
        let mut docs = self.docs.write().await;
        let doc = docs.entry(name.to_string()).or_insert_with(|| {
            log::info!("Creating document for room {}", name);
            let tree = TreeDoc::with_options(self.config.gc, Arc::clone(&self.config.kinds));
            Arc::new(SharedDoc::new(name, tree, self.config.broadcast_capacity))
        });
        Arc::clone(doc)
    }

    async fn ensure_ready(&self, doc: &Arc<SharedDoc>) {
        doc.ready
            .get_or_init(|| async {
                if let Some(persistence) = &self.persistence {
                    if let Err(e) = persistence.bind_state(doc.name(), doc).await {
                        log::error!(
                            "Room {}: failed to load persisted state, stored data will not be overwritten: {}",
                            doc.name(),
                            e
                        );
                        doc.mark_load_failed();
                    }
                }
                if let Err(e) = self.initializer.initialize(doc).await {
                    log::error!("Room {}: content initializer failed: {}", doc.name(), e);
                }
                if let Some(webhook) = &self.webhook {
                    webhook.watch(doc);
                }
            })
            .await;
    }

    /// Get or create `name` and register `conn` on it.
    pub async fn attach(&self, name: &str, conn: ConnId) -> Arc<SharedDoc> {
        loop {
            let doc = self.get_or_create(name).await;
            // Attach under the read lock so an eviction, which needs the
            // write lock, sees either no connection or a registered one.
            let docs = self.docs.read().await;
            if docs.get(name).is_some_and(|current| Arc::ptr_eq(current, &doc)) {
                doc.attach(conn);
                return doc;
            }
            // Evicted between creation and attach; start over.
        }
    }

    /// Unregister `conn`; the last connection out flushes the document
    /// and may schedule its eviction.
    pub async fn detach(self: &Arc<Self>, doc: &Arc<SharedDoc>, conn: ConnId) {
        let remaining = doc.detach(conn);
        log::debug!(
            "Room {}: connection {} detached, {} remaining",
            doc.name(),
            conn,
            remaining
        );
        if remaining > 0 {
            return;
        }

        self.flush(doc).await;

        if let (Some(_), Some(delay)) = (&self.persistence, self.config.idle_evict) {
            let registry = Arc::clone(self);
            let name = doc.name().to_string();
            let epoch = doc.epoch();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                registry.evict_if_idle(&name, epoch).await;
            });
        }
    }

    async fn flush(&self, doc: &SharedDoc) {
        if doc.load_failed() {
            log::warn!("Room {}: skipping flush, stored state never loaded", doc.name());
            return;
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.write_state(doc.name(), doc).await {
                log::error!("Room {}: failed to persist state: {}", doc.name(), e);
            }
        }
    }

    async fn evict_if_idle(&self, name: &str, epoch: u64) {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.get(name) else {
            return;
        };
        if doc.connection_count() > 0 || doc.epoch() != epoch {
            return;
        }
        let doc = Arc::clone(doc);
        self.flush(&doc).await;
        docs.remove(name);
        log::info!("Room {}: evicted after idle timeout", name);
    }

    /// Remove `name` if it has no connections, flushing it first.
    /// Returns whether a document was removed.
    pub async fn evict(&self, name: &str) -> bool {
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.get(name).map(Arc::clone) else {
            return false;
        };
        if doc.connection_count() > 0 {
            log::debug!("Room {}: not evicting, connections remain", name);
            return false;
        }
        self.flush(&doc).await;
        docs.remove(name);
        log::info!("Room {}: evicted", name);
        true
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SharedDoc>> {
        self.docs.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.docs.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.docs.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
