//! Document sync engine: local edits out, remote mutations in.
//!
//! ```text
//!   local edit ──► apply_local ──┬──► merge ──► DocumentStore
//!                                ├──► Outbound.broadcast (all)
//!                                └──► Outbound.durable   (durable only)
//!
//!   remote event ──► on_remote ──► echo? ──► merge ──► DocumentStore
//! ```
//!
//! Both paths go through the same `merge`, so a mutation arriving on the
//! broadcast path and again as a durable notification is applied once.

use std::time::{Duration, Instant};

use crate::clock::LamportClock;
use crate::error::EditError;
use crate::mutation::{LocalEdit, Mutation};
use crate::record::{Durability, EphemeralTags, PeerId, Record};
use crate::store::{DocumentStore, MergeOutcome};

/// Path a remote mutation arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    /// Change notification derived from a persisted write.
    Durable,
    /// Ephemeral fan-out from another peer.
    Broadcast,
    /// Initial load of persisted state on subscribe.
    Loaded,
}

/// What happened to a remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Originated locally; dropped.
    EchoSuppressed,
    /// Ephemeral mutation seen on a durable path; dropped.
    Rejected,
    Merged(MergeOutcome),
}

impl RemoteOutcome {
    pub fn changed(self) -> bool {
        matches!(self, RemoteOutcome::Merged(outcome) if outcome.changed())
    }
}

/// Mutations produced by a local edit batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outbound {
    /// Everything, for low-latency fan-out.
    pub broadcast: Vec<Mutation>,
    /// Durable subset, for the persistence path.
    pub durable: Vec<Mutation>,
}

impl Outbound {
    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty()
    }
}

pub struct DocumentSyncEngine {
    local: PeerId,
    clock: LamportClock,
    store: DocumentStore,
    tags: EphemeralTags,
}

impl DocumentSyncEngine {
    pub fn new(local: PeerId, tags: EphemeralTags) -> Self {
        Self {
            local,
            clock: LamportClock::new(local),
            store: DocumentStore::new(),
            tags,
        }
    }

    /// Stamp, classify and apply a batch of local edits.
    ///
    /// The batch is validated up front; on error the store is untouched.
    pub fn apply_local(&mut self, edits: Vec<LocalEdit>, now: Instant) -> Result<Outbound, EditError> {
        for edit in &edits {
            if edit.id().is_empty() {
                return Err(EditError::EmptyId);
            }
            if let LocalEdit::Put { id, type_tag, .. } = edit {
                if type_tag.is_empty() {
                    return Err(EditError::EmptyTypeTag(id.clone()));
                }
            }
        }

        let mut outbound = Outbound::default();
        for edit in edits {
            let stamp = self.clock.tick();
            let mutation = match edit {
                LocalEdit::Put {
                    id,
                    type_tag,
                    payload,
                } => {
                    let durability = self.tags.classify(&type_tag);
                    Mutation::Put {
                        record: Record {
                            id,
                            type_tag,
                            payload,
                            originator: self.local,
                        },
                        stamp,
                        durability,
                    }
                }
                LocalEdit::Delete { id } => {
                    let durability = self.store.durability_of(&id).unwrap_or(Durability::Durable);
                    Mutation::Delete {
                        id,
                        originator: self.local,
                        stamp,
                        durability,
                    }
                }
            };

            self.store.merge(mutation.clone(), now);
            if mutation.durability().is_durable() {
                outbound.durable.push(mutation.clone());
            }
            outbound.broadcast.push(mutation);
        }

        Ok(outbound)
    }

    /// Merge a mutation received from the transport.
    pub fn on_remote(&mut self, mutation: Mutation, via: Via, now: Instant) -> RemoteOutcome {
        if mutation.originator() == self.local {
            log::trace!("Suppressed echo of {} via {via:?}", mutation.id());
            return RemoteOutcome::EchoSuppressed;
        }
        if via != Via::Broadcast && !mutation.durability().is_durable() {
            log::warn!(
                "Dropping ephemeral record {} received on durable path",
                mutation.id()
            );
            return RemoteOutcome::Rejected;
        }

        self.clock.observe(mutation.stamp());
        RemoteOutcome::Merged(self.merge(mutation, now))
    }

    /// The single merge point for both local and remote mutations.
    pub fn merge(&mut self, mutation: Mutation, now: Instant) -> MergeOutcome {
        let id = mutation.id().clone();
        let outcome = self.store.merge(mutation, now);
        log::debug!("Merged {id}: {outcome:?}");
        outcome
    }

    /// Forget tombstones older than `ttl`.
    pub fn prune(&mut self, now: Instant, ttl: Duration) -> usize {
        let removed = self.store.prune_tombstones(now, ttl);
        if removed > 0 {
            log::debug!("Pruned {removed} tombstones");
        }
        removed
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn clock(&self) -> u64 {
        self.clock.current()
    }

    pub fn ephemeral_tags(&self) -> &EphemeralTags {
        &self.tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Stamp;
    use serde_json::json;

    fn engine() -> DocumentSyncEngine {
        DocumentSyncEngine::new(PeerId::random(), EphemeralTags::default())
    }

    fn remote_put(id: &str, counter: u64, peer: PeerId) -> Mutation {
        Mutation::Put {
            record: Record::new(id, "shape", json!({"n": counter}), peer),
            stamp: Stamp::new(counter, peer),
            durability: Durability::Durable,
        }
    }

    #[test]
    fn test_apply_local_splits_paths() {
        let mut engine = engine();
        let now = Instant::now();
        let out = engine
            .apply_local(
                vec![
                    LocalEdit::put("shape-1", "shape", json!({"x": 1})),
                    LocalEdit::put("camera-1", "camera", json!({"zoom": 2})),
                ],
                now,
            )
            .unwrap();

        assert_eq!(out.broadcast.len(), 2);
        assert_eq!(out.durable.len(), 1);
        assert_eq!(out.durable[0].id().as_str(), "shape-1");
        assert_eq!(engine.store().len(), 2);
    }

    #[test]
    fn test_apply_local_rejects_empty_id() {
        let mut engine = engine();
        let result = engine.apply_local(
            vec![
                LocalEdit::put("ok", "shape", json!({})),
                LocalEdit::put("", "shape", json!({})),
            ],
            Instant::now(),
        );
        assert_eq!(result, Err(EditError::EmptyId));
        assert!(engine.store().is_empty());
    }

    #[test]
    fn test_apply_local_rejects_empty_tag() {
        let mut engine = engine();
        let result = engine.apply_local(vec![LocalEdit::put("a", "", json!({}))], Instant::now());
        assert_eq!(result, Err(EditError::EmptyTypeTag("a".into())));
    }

    #[test]
    fn test_remote_put_idempotent() {
        let mut engine = engine();
        let peer = PeerId::random();
        let now = Instant::now();

        let first = engine.on_remote(remote_put("shape-1", 4, peer), Via::Broadcast, now);
        let second = engine.on_remote(remote_put("shape-1", 4, peer), Via::Durable, now);

        assert_eq!(first, RemoteOutcome::Merged(MergeOutcome::Inserted));
        assert_eq!(second, RemoteOutcome::Merged(MergeOutcome::Duplicate));
        assert_eq!(engine.store().len(), 1);
    }

    #[test]
    fn test_echo_suppressed() {
        let mut engine = engine();
        let now = Instant::now();
        let out = engine
            .apply_local(vec![LocalEdit::put("shape-1", "shape", json!({"v": 1}))], now)
            .unwrap();
        // Locally overwritten after sending.
        engine
            .apply_local(vec![LocalEdit::put("shape-1", "shape", json!({"v": 2}))], now)
            .unwrap();

        let echo = out.durable[0].clone();
        assert_eq!(engine.on_remote(echo, Via::Durable, now), RemoteOutcome::EchoSuppressed);
        assert_eq!(
            engine.store().get(&"shape-1".into()).unwrap().payload.value(),
            &json!({"v": 2})
        );
    }

    #[test]
    fn test_ephemeral_on_durable_path_rejected() {
        let mut engine = engine();
        let peer = PeerId::random();
        let m = Mutation::Put {
            record: Record::new("cam", "camera", json!({}), peer),
            stamp: Stamp::new(1, peer),
            durability: Durability::Ephemeral,
        };
        assert_eq!(engine.on_remote(m.clone(), Via::Durable, Instant::now()), RemoteOutcome::Rejected);
        assert!(engine.store().is_empty());

        assert!(engine.on_remote(m, Via::Broadcast, Instant::now()).changed());
    }

    #[test]
    fn test_remote_stamp_advances_clock() {
        let mut engine = engine();
        let peer = PeerId::random();
        let now = Instant::now();
        engine.on_remote(remote_put("a", 41, peer), Via::Broadcast, now);

        let out = engine
            .apply_local(vec![LocalEdit::put("a", "shape", json!("mine"))], now)
            .unwrap();
        assert_eq!(out.broadcast[0].stamp().counter, 42);
        assert_eq!(
            engine.store().get(&"a".into()).unwrap().payload.value(),
            &json!("mine")
        );
    }

    #[test]
    fn test_local_delete_twice_no_error() {
        let mut engine = engine();
        let now = Instant::now();
        engine
            .apply_local(vec![LocalEdit::put("shape-1", "shape", json!({}))], now)
            .unwrap();

        engine.apply_local(vec![LocalEdit::delete("shape-1")], now).unwrap();
        let second = engine.apply_local(vec![LocalEdit::delete("shape-1")], now);

        assert!(second.is_ok());
        assert!(!engine.store().contains(&"shape-1".into()));
    }

    #[test]
    fn test_delete_of_ephemeral_stays_ephemeral() {
        let mut engine = engine();
        let now = Instant::now();
        engine
            .apply_local(vec![LocalEdit::put("cam", "camera", json!({}))], now)
            .unwrap();
        let out = engine.apply_local(vec![LocalEdit::delete("cam")], now).unwrap();
        assert_eq!(out.broadcast.len(), 1);
        assert!(out.durable.is_empty());
    }
}
