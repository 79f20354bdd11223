//! Durable record storage behind the relay.
//!
//! ```text
//!  Persist(mutation) ──► RoomGroup::persist ──► Repository::upsert / delete
//!                                 │
//!                                 └──► Durable(mutation) fan-out
//!
//!  Join ──► RoomGroup::load ──► Repository::load ──► Loaded(records)
//! ```
//!
//! Only durable records reach a repository. Rows are keyed by
//! `(room, record id)` and resolved the same way replicas resolve them: a
//! write applies only if its stamp is strictly greater than the stored one.
//! Deletes leave a tombstone carrying their stamp, so a reordered older put
//! cannot bring the row back and an older delete cannot remove a newer put.
//! Tombstones are dropped by [`Repository::prune_tombstones`].

pub mod rocks;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use huddle_core::{Durability, Mutation, Record, RecordId, RoomId, Stamp};

use crate::error::PersistenceError;
use crate::protocol::now_millis;

pub use rocks::{RocksRepository, RoomMetadata, StoreConfig};

/// A record as it sits in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub record: Record,
    pub stamp: Stamp,
}

impl StoredRecord {
    pub fn into_mutation(self) -> Mutation {
        Mutation::Put {
            record: self.record,
            stamp: self.stamp,
            durability: Durability::Durable,
        }
    }
}

/// Marker left by a delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub stamp: Stamp,
    /// Milliseconds since epoch
    pub deleted_at: u64,
}

impl Tombstone {
    pub fn new(stamp: Stamp) -> Self {
        Self {
            stamp,
            deleted_at: now_millis(),
        }
    }

    pub fn into_mutation(self, id: RecordId) -> Mutation {
        Mutation::Delete {
            id,
            originator: self.stamp.peer,
            stamp: self.stamp,
            durability: Durability::Durable,
        }
    }

    pub fn is_expired(&self, now_ms: u64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.deleted_at) >= ttl.as_millis() as u64
    }
}

/// Narrow CRUD over room records.
pub trait Repository: Send + Sync {
    /// Insert or replace. Returns `false` if an equal or newer stamp is
    /// already stored, live or tombstone.
    fn upsert(&self, room: &RoomId, record: &Record, stamp: Stamp) -> Result<bool, PersistenceError>;

    /// Tombstone `id` at `stamp`. Returns `false` if an equal or newer stamp
    /// is already stored; the live row, if any, is then kept.
    fn delete(&self, room: &RoomId, id: &RecordId, stamp: Stamp) -> Result<bool, PersistenceError>;

    /// Live rows only.
    fn load(&self, room: &RoomId) -> Result<Vec<StoredRecord>, PersistenceError>;

    /// Deleted ids still within their grace period.
    fn tombstones(&self, room: &RoomId) -> Result<Vec<(RecordId, Tombstone)>, PersistenceError>;

    /// Rooms with at least one live record.
    fn rooms(&self) -> Result<Vec<RoomId>, PersistenceError>;

    /// Drop tombstones older than `ttl`. Returns how many were removed.
    fn prune_tombstones(&self, ttl: Duration) -> Result<usize, PersistenceError>;
}

/// Apply a durable mutation to a repository.
pub fn write_mutation(repo: &dyn Repository, room: &RoomId, mutation: &Mutation) -> Result<bool, PersistenceError> {
    if !mutation.durability().is_durable() {
        return Err(PersistenceError::NotDurable(mutation.id().clone()));
    }
    match mutation {
        Mutation::Put { record, stamp, .. } => repo.upsert(room, record, *stamp),
        Mutation::Delete { id, stamp, .. } => repo.delete(room, id, *stamp),
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory repository
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Row {
    Live(StoredRecord),
    Deleted(Tombstone),
}

impl Row {
    fn stamp(&self) -> Stamp {
        match self {
            Row::Live(row) => row.stamp,
            Row::Deleted(tombstone) => tombstone.stamp,
        }
    }
}

/// Process-local repository. State is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    rooms: RwLock<HashMap<RoomId, HashMap<RecordId, Row>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tombstone_count(&self, room: &RoomId) -> usize {
        self.rooms
            .read()
            .map(|rooms| {
                rooms
                    .get(room)
                    .map_or(0, |rows| rows.values().filter(|r| matches!(r, Row::Deleted(_))).count())
            })
            .unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> PersistenceError {
    PersistenceError::Database("repository lock poisoned".into())
}

impl Repository for MemoryRepository {
    fn upsert(&self, room: &RoomId, record: &Record, stamp: Stamp) -> Result<bool, PersistenceError> {
        let mut rooms = self.rooms.write().map_err(poisoned)?;
        let rows = rooms.entry(room.clone()).or_default();
        if rows.get(&record.id).is_some_and(|row| row.stamp() >= stamp) {
            return Ok(false);
        }
        rows.insert(
            record.id.clone(),
            Row::Live(StoredRecord {
                record: record.clone(),
                stamp,
            }),
        );
        Ok(true)
    }

    fn delete(&self, room: &RoomId, id: &RecordId, stamp: Stamp) -> Result<bool, PersistenceError> {
        let mut rooms = self.rooms.write().map_err(poisoned)?;
        let rows = rooms.entry(room.clone()).or_default();
        if rows.get(id).is_some_and(|row| row.stamp() >= stamp) {
            return Ok(false);
        }
        rows.insert(id.clone(), Row::Deleted(Tombstone::new(stamp)));
        Ok(true)
    }

    fn load(&self, room: &RoomId) -> Result<Vec<StoredRecord>, PersistenceError> {
        let rooms = self.rooms.read().map_err(poisoned)?;
        let mut out: Vec<StoredRecord> = rooms
            .get(room)
            .map(|rows| {
                rows.values()
                    .filter_map(|row| match row {
                        Row::Live(stored) => Some(stored.clone()),
                        Row::Deleted(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(out)
    }

    fn tombstones(&self, room: &RoomId) -> Result<Vec<(RecordId, Tombstone)>, PersistenceError> {
        let rooms = self.rooms.read().map_err(poisoned)?;
        let mut out: Vec<(RecordId, Tombstone)> = rooms
            .get(room)
            .map(|rows| {
                rows.iter()
                    .filter_map(|(id, row)| match row {
                        Row::Deleted(t) => Some((id.clone(), t.clone())),
                        Row::Live(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn rooms(&self) -> Result<Vec<RoomId>, PersistenceError> {
        let rooms = self.rooms.read().map_err(poisoned)?;
        let mut out: Vec<RoomId> = rooms
            .iter()
            .filter(|(_, rows)| rows.values().any(|row| matches!(row, Row::Live(_))))
            .map(|(room, _)| room.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    fn prune_tombstones(&self, ttl: Duration) -> Result<usize, PersistenceError> {
        let now = now_millis();
        let mut rooms = self.rooms.write().map_err(poisoned)?;
        let mut removed = 0;
        for rows in rooms.values_mut() {
            let before = rows.len();
            rows.retain(|_, row| !matches!(row, Row::Deleted(t) if t.is_expired(now, ttl)));
            removed += before - rows.len();
        }
        rooms.retain(|_, rows| !rows.is_empty());
        Ok(removed)
    }
}
