//! Local record store with per-id last-writer-wins.
//!
//! Every entry keeps the stamp of the mutation that produced it, including
//! deletes (tombstones). A mutation is applied only when its stamp is strictly
//! greater than the stored one, which makes `merge` idempotent and independent
//! of arrival order:
//!
//! ```text
//!   incoming stamp  vs  stored stamp
//!   ─────────────────────────────────
//!        ==                 → Duplicate   (re-delivery)
//!        <                  → Superseded  (stale)
//!        >  / no entry      → applied
//! ```
//!
//! Tombstones are kept for a grace period so that a stale put racing a
//! delete cannot resurrect the record; after `prune_tombstones` they are gone.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::clock::Stamp;
use crate::mutation::Mutation;
use crate::record::{Durability, Record, RecordId};

#[derive(Debug, Clone)]
enum Entry {
    Live {
        record: Record,
        stamp: Stamp,
        durability: Durability,
    },
    Tombstone {
        stamp: Stamp,
        deleted_at: Instant,
    },
}

impl Entry {
    fn stamp(&self) -> Stamp {
        match self {
            Entry::Live { stamp, .. } | Entry::Tombstone { stamp, .. } => *stamp,
        }
    }
}

/// Result of merging one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New live record.
    Inserted,
    /// Existing live record replaced.
    Updated,
    /// Live record turned into a tombstone.
    Removed,
    /// Delete of an id that was not live; tombstone recorded, nothing visible.
    AlreadyAbsent,
    /// Same stamp already applied.
    Duplicate,
    /// Older than what the store holds.
    Superseded,
}

impl MergeOutcome {
    /// Whether the visible record set changed.
    pub fn changed(self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted | MergeOutcome::Updated | MergeOutcome::Removed
        )
    }
}

/// id → record mapping for one room.
#[derive(Debug, Default)]
pub struct DocumentStore {
    entries: HashMap<RecordId, Entry>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a stamped mutation.
    pub fn merge(&mut self, mutation: Mutation, now: Instant) -> MergeOutcome {
        if let Some(existing) = self.entries.get(mutation.id()) {
            let current = existing.stamp();
            let incoming = mutation.stamp();
            if incoming == current {
                return MergeOutcome::Duplicate;
            }
            if incoming < current {
                return MergeOutcome::Superseded;
            }
        }

        match mutation {
            Mutation::Put {
                record,
                stamp,
                durability,
            } => {
                let id = record.id.clone();
                let previous = self.entries.insert(
                    id,
                    Entry::Live {
                        record,
                        stamp,
                        durability,
                    },
                );
                match previous {
                    Some(Entry::Live { .. }) => MergeOutcome::Updated,
                    _ => MergeOutcome::Inserted,
                }
            }
            Mutation::Delete { id, stamp, .. } => {
                let previous = self.entries.insert(
                    id,
                    Entry::Tombstone {
                        stamp,
                        deleted_at: now,
                    },
                );
                match previous {
                    Some(Entry::Live { .. }) => MergeOutcome::Removed,
                    _ => MergeOutcome::AlreadyAbsent,
                }
            }
        }
    }

    /// Live record by id.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        match self.entries.get(id) {
            Some(Entry::Live { record, .. }) => Some(record),
            _ => None,
        }
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.get(id).is_some()
    }

    /// Stamp of the entry for `id`, live or tombstone.
    pub fn stamp_of(&self, id: &RecordId) -> Option<Stamp> {
        self.entries.get(id).map(Entry::stamp)
    }

    /// Durability of a live record.
    pub fn durability_of(&self, id: &RecordId) -> Option<Durability> {
        match self.entries.get(id) {
            Some(Entry::Live { durability, .. }) => Some(*durability),
            _ => None,
        }
    }

    pub fn is_tombstoned(&self, id: &RecordId) -> bool {
        matches!(self.entries.get(id), Some(Entry::Tombstone { .. }))
    }

    /// All live records, in no particular order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.values().filter_map(|entry| match entry {
            Entry::Live { record, .. } => Some(record),
            Entry::Tombstone { .. } => None,
        })
    }

    /// Live durable records with their stamps (what a persisted copy should hold).
    pub fn durable_snapshot(&self) -> Vec<Mutation> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Live {
                    record,
                    stamp,
                    durability: Durability::Durable,
                } => Some(Mutation::Put {
                    record: record.clone(),
                    stamp: *stamp,
                    durability: Durability::Durable,
                }),
                _ => None,
            })
            .collect()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Tombstone { .. }))
            .count()
    }

    /// Drop tombstones older than `ttl`. Returns how many were removed.
    pub fn prune_tombstones(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry {
            Entry::Tombstone { deleted_at, .. } => now.saturating_duration_since(*deleted_at) < ttl,
            Entry::Live { .. } => true,
        });
        before - self.entries.len()
    }
}
