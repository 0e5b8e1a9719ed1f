//! RocksDB-backed persistence.
//!
//! Column families:
//! - `documents`: full document state per room (LZ4 compressed)
//! - `updates`  : incremental updates (LZ4 compressed, keyed by room + sequence)
//! - `metadata` : per-room bookkeeping (bincode)
//!
//! Keys start with the room name prefixed by its length as a big-endian
//! u16, so no room's key range overlaps another's. Update keys append the
//! sequence number as a big-endian u64 and sort in arrival order.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use super::{Persistence, PersistenceError};
use crate::doc::{lock, SharedDoc};

const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_METADATA];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("arbor_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored alongside each room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub name: String,
    /// Sequence number of the last stored update.
    pub last_seq: u64,
    /// Updates currently stored (not yet folded into the snapshot).
    pub update_count: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since the epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(name: &str) -> Self {
        let now = unix_now();
        Self {
            name: name.to_string(),
            last_seq: 0,
            update_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, PersistenceError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4 compressed before they reach RocksDB.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)).max(1) as u64);
            }
            CF_UPDATES => {
                // Many small writes, range-scanned per room.
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Replace the stored state of `name`.
    pub fn save_snapshot(&self, name: &str, state: &[u8]) -> Result<DocumentMetadata, PersistenceError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = room_key(name)?;
        let compressed = lz4_flex::compress_prepend_size(state);

        let _guard = lock(&self.write_lock);
        let mut meta = self
            .load_metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        meta.snapshot_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(meta)
    }

    pub fn load_snapshot(&self, name: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(&cf, room_key(name)?)? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| PersistenceError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Updates ──────────────────────────────────────────────────────

    /// Append an update for `name`; returns its sequence number.
    pub fn store_update(&self, name: &str, update: &[u8]) -> Result<u64, PersistenceError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let compressed = lz4_flex::compress_prepend_size(update);

        let _guard = lock(&self.write_lock);
        let mut meta = self
            .load_metadata(name)?
            .unwrap_or_else(|| DocumentMetadata::new(name));
        meta.last_seq += 1;
        meta.update_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_updates, update_key(name, meta.last_seq)?, &compressed);
        batch.put_cf(&cf_meta, room_key(name)?, meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(meta.last_seq)
    }

    /// Every stored update of `name` in sequence order.
    pub fn load_updates(&self, name: &str) -> Result<Vec<(u64, Vec<u8>)>, PersistenceError> {
        let cf = self.cf(CF_UPDATES)?;
        let prefix = room_key(name)?;
        let start = update_key(name, 0)?;

        let mut updates = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            let Some(seq) = update_seq(&prefix, &key) else {
                break;
            };
            let update = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| PersistenceError::Compression(e.to_string()))?;
            updates.push((seq, update));
        }
        Ok(updates)
    }

    /// Delete stored updates of `name` with a sequence number up to and
    /// including `up_to`. Returns how many were removed.
    pub fn compact_updates(&self, name: &str, up_to: u64) -> Result<u64, PersistenceError> {
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = room_key(name)?;
        let start = update_key(name, 0)?;

        let _guard = lock(&self.write_lock);
        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        for item in self
            .db
            .iterator_cf(&cf_updates, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            match update_seq(&prefix, &key) {
                Some(seq) if seq <= up_to => {
                    batch.delete_cf(&cf_updates, &key);
                    count += 1;
                }
                _ => break,
            }
        }

        if count > 0 {
            if let Some(mut meta) = self.load_metadata(name)? {
                meta.update_count = meta.update_count.saturating_sub(count);
                meta.updated_at = unix_now();
                batch.put_cf(&cf_meta, &prefix, meta.encode()?);
            }
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, name: &str) -> Result<Option<DocumentMetadata>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, room_key(name)?)?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    /// Names of every stored room.
    pub fn list_rooms(&self) -> Result<Vec<String>, PersistenceError> {
        let cf = self.cf(CF_METADATA)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            names.push(DocumentMetadata::decode(&value)?.name);
        }
        Ok(names)
    }

    pub fn flush(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or(PersistenceError::MissingColumnFamily(name))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

/// `len:u16 BE` followed by the room name.
fn room_key(name: &str) -> Result<Vec<u8>, PersistenceError> {
    let len = u16::try_from(name.len()).map_err(|_| PersistenceError::NameTooLong(name.len()))?;
    let mut key = Vec::with_capacity(2 + name.len());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    Ok(key)
}

fn update_key(name: &str, seq: u64) -> Result<Vec<u8>, PersistenceError> {
    let mut key = room_key(name)?;
    key.extend_from_slice(&seq.to_be_bytes());
    Ok(key)
}

/// Sequence number of `key` if it is an update key of the room `prefix`.
fn update_seq(prefix: &[u8], key: &[u8]) -> Option<u64> {
    let seq = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = seq.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

/// [`Persistence`] over a [`DocumentStore`].
///
/// Binding a room folds its stored updates into a fresh snapshot, then
/// spawns a task that appends every later update until the document is
/// dropped.
#[derive(Clone)]
pub struct RocksPersistence {
    store: Arc<DocumentStore>,
}

impl RocksPersistence {
    pub fn new(store: DocumentStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn open(config: StoreConfig) -> Result<Self, PersistenceError> {
        DocumentStore::open(config).map(Self::new)
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    fn flush_room(&self, name: &str, doc: &SharedDoc) -> Result<u64, PersistenceError> {
        let up_to = self
            .store
            .load_metadata(name)?
            .map_or(0, |meta| meta.last_seq);
        let state = doc.tree().full_state();
        self.store.save_snapshot(name, &state)?;
        self.store.compact_updates(name, up_to)
    }
}

#[async_trait]
impl Persistence for RocksPersistence {
    async fn bind_state(&self, name: &str, doc: &SharedDoc) -> Result<(), PersistenceError> {
        let snapshot = self.store.load_snapshot(name)?;
        let updates = self.store.load_updates(name)?;

        if let Some(state) = &snapshot {
            doc.tree().apply_update(state)?;
        }
        for (_, update) in &updates {
            doc.tree().apply_update(update)?;
        }
        if snapshot.is_some() || !updates.is_empty() {
            let folded = self.flush_room(name, doc)?;
            log::info!(
                "Room {}: restored from store ({} updates folded)",
                name,
                folded
            );
        }

        let store = Arc::clone(&self.store);
        let room = name.to_string();
        let mut updates = doc.subscribe_updates();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        if let Err(e) = store.store_update(&room, &update) {
                            log::error!("Room {}: failed to store update: {}", room, e);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        // The next write_state snapshot covers what was skipped.
                        log::warn!("Room {}: store lagged, {} updates skipped", room, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            log::debug!("Room {}: update writer stopped", room);
        });
        Ok(())
    }

    async fn write_state(&self, name: &str, doc: &SharedDoc) -> Result<(), PersistenceError> {
        let compacted = self.flush_room(name, doc)?;
        self.store.flush()?;
        log::debug!("Room {}: flushed, {} stored updates compacted", name, compacted);
        Ok(())
    }
}
