//! RocksDB-backed record repository.
//!
//! Column families:
//! - `records` — one row per record, LZ4-compressed bincode [`StoredRecord`],
//!   keyed by `<room len:4 BE><room><record id>` so a room is a key prefix
//! - `tombstones` — bincode [`Tombstone`] per deleted record, same key layout
//! - `rooms`   — per-room [`RoomMetadata`] (bincode), keyed by room name
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use huddle_core::{Record, RecordId, RoomId, Stamp};

use super::{Repository, StoredRecord, Tombstone};
use crate::protocol::now_millis;
use crate::error::PersistenceError;

const CF_RECORDS: &str = "records";
const CF_TOMBSTONES: &str = "tombstones";
const CF_ROOMS: &str = "rooms";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS, CF_TOMBSTONES, CF_ROOMS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
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
            path: PathBuf::from("huddle_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-supplied directory.
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

/// Bookkeeping kept next to each room's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room: RoomId,
    pub record_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn new(room: RoomId) -> Self {
        let now = now_secs();
        Self {
            room,
            record_count: 0,
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

/// Durable repository on RocksDB.
pub struct RocksRepository {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write of record rows and room metadata.
    write_lock: Mutex<()>,
}

impl RocksRepository {
    /// Open (or create) the repository at the configured path.
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

        log::info!("Opened record store at {}", config.path.display());

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

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_RECORDS => {
                // Many small rows, prefix-scanned by room on join
                opts.set_max_write_buffer_number(4);
            }
            CF_TOMBSTONES | CF_ROOMS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Metadata for one room, if it has ever held a record.
    pub fn room_metadata(&self, room: &RoomId) -> Result<Option<RoomMetadata>, PersistenceError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(RoomMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), PersistenceError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, PersistenceError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Database(format!("Column family '{name}' not found")))
    }

    fn room_prefix(room: &RoomId) -> Vec<u8> {
        let name = room.as_str().as_bytes();
        let mut key = Vec::with_capacity(4 + name.len());
        key.extend_from_slice(&(name.len() as u32).to_be_bytes());
        key.extend_from_slice(name);
        key
    }

    fn record_key(room: &RoomId, id: &RecordId) -> Vec<u8> {
        let mut key = Self::room_prefix(room);
        key.extend_from_slice(id.as_str().as_bytes());
        key
    }

    fn encode_row(row: &StoredRecord) -> Result<Vec<u8>, PersistenceError> {
        let bytes = bincode::serde::encode_to_vec(row, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&bytes))
    }

    fn decode_row(value: &[u8]) -> Result<StoredRecord, PersistenceError> {
        let bytes = lz4_flex::decompress_size_prepended(value)
            .map_err(|e| PersistenceError::Compression(e.to_string()))?;
        let (row, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(row)
    }

    fn encode_tombstone(tombstone: &Tombstone) -> Result<Vec<u8>, PersistenceError> {
        bincode::serde::encode_to_vec(tombstone, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))
    }

    fn decode_tombstone(value: &[u8]) -> Result<Tombstone, PersistenceError> {
        let (tombstone, _) = bincode::serde::decode_from_slice(value, bincode::config::standard())
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        Ok(tombstone)
    }

    fn tombstone(&self, key: &[u8]) -> Result<Option<Tombstone>, PersistenceError> {
        let cf = self.cf(CF_TOMBSTONES)?;
        match self.db.get_cf(&cf, key)? {
            Some(value) => Ok(Some(Self::decode_tombstone(&value)?)),
            None => Ok(None),
        }
    }

    fn live_row(&self, key: &[u8]) -> Result<Option<StoredRecord>, PersistenceError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(&cf, key)? {
            Some(value) => Ok(Some(Self::decode_row(&value)?)),
            None => Ok(None),
        }
    }

    /// Tombstones currently held for `room`.
    pub fn tombstone_count(&self, room: &RoomId) -> Result<usize, PersistenceError> {
        Ok(self.tombstones(room)?.len())
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, PersistenceError> {
        self.write_lock
            .lock()
            .map_err(|_| PersistenceError::Database("write lock poisoned".into()))
    }
}

impl Repository for RocksRepository {
    fn upsert(&self, room: &RoomId, record: &Record, stamp: Stamp) -> Result<bool, PersistenceError> {
        let _guard = self.lock()?;
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_tombstones = self.cf(CF_TOMBSTONES)?;
        let cf_rooms = self.cf(CF_ROOMS)?;
        let key = Self::record_key(room, &record.id);

        let existing = self.live_row(&key)?;
        if existing.as_ref().is_some_and(|row| row.stamp >= stamp) {
            return Ok(false);
        }
        let tombstone = self.tombstone(&key)?;
        if tombstone.as_ref().is_some_and(|t| t.stamp >= stamp) {
            return Ok(false);
        }

        let mut meta = self
            .room_metadata(room)?
            .unwrap_or_else(|| RoomMetadata::new(room.clone()));
        if existing.is_none() {
            meta.record_count += 1;
        }
        meta.updated_at = now_secs();

        let row = StoredRecord {
            record: record.clone(),
            stamp,
        };

        // Atomic batch: row + room metadata, tombstone cleared
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_records, &key, Self::encode_row(&row)?);
        if tombstone.is_some() {
            batch.delete_cf(&cf_tombstones, &key);
        }
        batch.put_cf(&cf_rooms, room.as_str().as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(true)
    }

    fn delete(&self, room: &RoomId, id: &RecordId, stamp: Stamp) -> Result<bool, PersistenceError> {
        let _guard = self.lock()?;
        let cf_records = self.cf(CF_RECORDS)?;
        let cf_tombstones = self.cf(CF_TOMBSTONES)?;
        let cf_rooms = self.cf(CF_ROOMS)?;
        let key = Self::record_key(room, id);

        let existing = self.live_row(&key)?;
        if existing.as_ref().is_some_and(|row| row.stamp >= stamp) {
            return Ok(false);
        }
        if self.tombstone(&key)?.is_some_and(|t| t.stamp >= stamp) {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_tombstones, &key, Self::encode_tombstone(&Tombstone::new(stamp))?);
        if existing.is_some() {
            batch.delete_cf(&cf_records, &key);
            if let Some(mut meta) = self.room_metadata(room)? {
                meta.record_count = meta.record_count.saturating_sub(1);
                meta.updated_at = now_secs();
                if meta.record_count == 0 {
                    batch.delete_cf(&cf_rooms, room.as_str().as_bytes());
                } else {
                    batch.put_cf(&cf_rooms, room.as_str().as_bytes(), meta.encode()?);
                }
            }
        }
        self.db.write_opt(batch, &self.write_opts())?;

        Ok(true)
    }

    fn load(&self, room: &RoomId) -> Result<Vec<StoredRecord>, PersistenceError> {
        let cf = self.cf(CF_RECORDS)?;
        let prefix = Self::room_prefix(room);

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push(Self::decode_row(&value)?);
        }

        Ok(rows)
    }

    fn tombstones(&self, room: &RoomId) -> Result<Vec<(RecordId, Tombstone)>, PersistenceError> {
        let cf = self.cf(CF_TOMBSTONES)?;
        let prefix = Self::room_prefix(room);

        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            out.push((RecordId::from(id), Self::decode_tombstone(&value)?));
        }
        Ok(out)
    }

    fn rooms(&self) -> Result<Vec<RoomId>, PersistenceError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(RoomMetadata::decode(&value)?.room);
        }
        Ok(rooms)
    }

    fn prune_tombstones(&self, ttl: Duration) -> Result<usize, PersistenceError> {
        let _guard = self.lock()?;
        let cf = self.cf(CF_TOMBSTONES)?;
        let now = now_millis();

        let mut batch = WriteBatch::default();
        let mut removed = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            if Self::decode_tombstone(&value)?.is_expired(now, ttl) {
                batch.delete_cf(&cf, &key);
                removed += 1;
            }
        }
        if removed > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
            log::debug!("Pruned {removed} tombstones");
        }
        Ok(removed)
    }
}

fn now_secs() -> u64 {
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
