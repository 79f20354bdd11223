//! Per-room fan-out with presence tracking and durable writes.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames; a member that falls further behind sees `Lagged` and must be
//! brought back with [`RoomGroup::resync`].
//!
//! Joining is subscribe, then load, then [`admit`](RoomGroup::admit): a
//! write landing between the steps shows up in the snapshot, the stream, or
//! both, and replicas merge duplicates away. The room stamps `joined_at`
//! itself so arrival order does not depend on client clocks. Each admission
//! carries a token; only the connection holding the current token can
//! remove the member.
//!
//! ```text
//!             ┌──────────────── RoomGroup ────────────────┐
//!  admit ───► │ members: HashMap<PeerId, Member>           │
//!  publish ─► │ sender: broadcast::Sender<Arc<ServerFrame>>│ ──► every member
//!  persist ─► │ repository.upsert / delete ──► Durable(m)  │     (sender too)
//!             └────────────────────────────────────────────┘
//! ```
//!
//! Shared by the in-process [`MemoryHub`](crate::channel::MemoryHub) and the
//! WebSocket [`RelayServer`](crate::relay::RelayServer).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use huddle_core::{Mutation, PeerId, RoomId};

use crate::error::PersistenceError;
use crate::persistence::{self, Repository};
use crate::protocol::{now_millis, BroadcastMessage, PresenceMeta, ServerFrame};

/// Statistics for monitoring room health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    /// Frames sent while the room had no receivers.
    pub frames_dropped: u64,
    pub durable_writes: u64,
    pub failed_writes: u64,
    pub active_peers: usize,
}

/// Lock-free counters on the hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    durable_writes: AtomicU64,
    failed_writes: AtomicU64,
}

/// A member as admitted by the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Identifies the connection that holds the membership.
    pub token: u64,
    /// The member's presence, with the room-assigned `joined_at`.
    pub meta: PresenceMeta,
}

#[derive(Default)]
struct Members {
    by_peer: HashMap<PeerId, Admission>,
    next_token: u64,
    last_joined_at: u64,
}

impl Members {
    fn snapshot(&self) -> Vec<PresenceMeta> {
        let mut out: Vec<PresenceMeta> = self.by_peer.values().map(|a| a.meta.clone()).collect();
        out.sort_by_key(|m| (m.joined_at, m.peer_id));
        out
    }
}

/// Fan-out group for a single room.
pub struct RoomGroup {
    room: RoomId,
    sender: broadcast::Sender<Arc<ServerFrame>>,
    members: RwLock<Members>,
    repository: Arc<dyn Repository>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl RoomGroup {
    /// `capacity` bounds how many frames each member may lag behind.
    pub fn new(room: RoomId, capacity: usize, repository: Arc<dyn Repository>) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            room,
            sender,
            members: RwLock::new(Members::default()),
            repository,
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// A receiver for everything sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ServerFrame>> {
        self.sender.subscribe()
    }

    /// Add a member, replacing any earlier membership of the same peer.
    ///
    /// `joined_at` is overwritten with the room's clock, strictly later than
    /// every earlier admission. Announces the join followed by the full
    /// presence list.
    pub async fn admit(&self, mut meta: PresenceMeta) -> Admission {
        let (admission, snapshot) = {
            let mut members = self.members.write().await;
            members.next_token += 1;
            members.last_joined_at = now_millis().max(members.last_joined_at + 1);
            meta.joined_at = members.last_joined_at;
            let admission = Admission {
                token: members.next_token,
                meta,
            };
            members.by_peer.insert(admission.meta.peer_id, admission.clone());
            (admission, members.snapshot())
        };
        log::info!("Peer {} joined room {}", admission.meta.peer_id, self.room);
        self.send(ServerFrame::PresenceJoin(admission.meta.clone()));
        self.send(ServerFrame::PresenceSync(snapshot));
        admission
    }

    /// Subscribe, then admit. The receiver sees the member's own join
    /// followed by the full presence list.
    pub async fn track(&self, meta: PresenceMeta) -> (Admission, broadcast::Receiver<Arc<ServerFrame>>) {
        let rx = self.subscribe();
        (self.admit(meta).await, rx)
    }

    /// Remove a member and announce it. No-op unless `admission` is still
    /// the peer's current membership.
    pub async fn untrack(&self, admission: &Admission) -> Option<PresenceMeta> {
        let peer_id = admission.meta.peer_id;
        let (removed, snapshot) = {
            let mut members = self.members.write().await;
            match members.by_peer.get(&peer_id) {
                Some(current) if current.token == admission.token => {}
                Some(_) => {
                    log::debug!("Peer {peer_id} rejoined room {}, keeping it", self.room);
                    return None;
                }
                None => return None,
            }
            let removed = members.by_peer.remove(&peer_id).map(|a| a.meta);
            (removed, members.snapshot())
        };
        log::info!("Peer {peer_id} left room {}", self.room);
        self.send(ServerFrame::PresenceLeave(peer_id));
        self.send(ServerFrame::PresenceSync(snapshot));
        removed
    }

    /// Fan an ephemeral message out to every member, the sender included.
    pub fn publish(&self, from: PeerId, message: BroadcastMessage) -> usize {
        self.send(ServerFrame::Broadcast { from, message })
    }

    /// Store a durable mutation, then announce it as `Durable`.
    ///
    /// A write skipped because a newer stamp is stored is still announced;
    /// receivers drop it by stamp comparison.
    pub fn persist(&self, mutation: &Mutation) -> Result<usize, PersistenceError> {
        match persistence::write_mutation(self.repository.as_ref(), &self.room, mutation) {
            Ok(_) => {
                self.atomic_stats.durable_writes.fetch_add(1, Ordering::Relaxed);
                Ok(self.send(ServerFrame::Durable(mutation.clone())))
            }
            Err(e) => {
                self.atomic_stats.failed_writes.fetch_add(1, Ordering::Relaxed);
                log::error!("Persist of {} in room {} failed: {e}", mutation.id(), self.room);
                Err(e)
            }
        }
    }

    /// Durable room state as mutations, ready to merge.
    pub fn load(&self) -> Result<Vec<Mutation>, PersistenceError> {
        Ok(self
            .repository
            .load(&self.room)?
            .into_iter()
            .map(|row| row.into_mutation())
            .collect())
    }

    /// Frames that bring a lagged receiver back in line: live records and
    /// retained deletes, then the member list.
    pub async fn resync(&self) -> Result<Vec<ServerFrame>, PersistenceError> {
        let mut state = self.load()?;
        state.extend(
            self.repository
                .tombstones(&self.room)?
                .into_iter()
                .map(|(id, tombstone)| tombstone.into_mutation(id)),
        );
        Ok(vec![ServerFrame::Loaded(state), ServerFrame::PresenceSync(self.members().await)])
    }

    /// Re-send the authoritative member list (heartbeat).
    pub async fn announce_presence(&self) -> usize {
        let snapshot = self.members().await;
        self.send(ServerFrame::PresenceSync(snapshot))
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.by_peer.len()
    }

    pub async fn members(&self) -> Vec<PresenceMeta> {
        self.members.read().await.snapshot()
    }

    pub async fn has_member(&self, peer_id: &PeerId) -> bool {
        self.members.read().await.by_peer.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            durable_writes: self.atomic_stats.durable_writes.load(Ordering::Relaxed),
            failed_writes: self.atomic_stats.failed_writes.load(Ordering::Relaxed),
            active_peers: self.members.read().await.by_peer.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn send(&self, frame: ServerFrame) -> usize {
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(frame)) {
            Ok(count) => count,
            Err(_) => {
                self.atomic_stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }
}

/// Maps room ids to fan-out groups sharing one repository.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RoomGroup>>>,
    default_capacity: usize,
    repository: Arc<dyn Repository>,
}

impl RoomRegistry {
    pub fn new(default_capacity: usize, repository: Arc<dyn Repository>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
            repository,
        }
    }

    pub async fn get_or_create(&self, room: &RoomId) -> Arc<RoomGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = rooms.get(room) {
            return group.clone();
        }

        let group = Arc::new(RoomGroup::new(
            room.clone(),
            self.default_capacity,
            self.repository.clone(),
        ));
        rooms.insert(room.clone(), group.clone());
        group
    }

    pub async fn get(&self, room: &RoomId) -> Option<Arc<RoomGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Drop a room with no members. Stored records are untouched.
    pub async fn remove_if_empty(&self, room: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.member_count().await == 0 {
                rooms.remove(room);
                log::debug!("Room {room} closed");
                return true;
            }
        }
        false
    }

    /// Heartbeat every open room's presence list.
    pub async fn announce_all(&self) -> usize {
        let groups: Vec<Arc<RoomGroup>> = self.rooms.read().await.values().cloned().collect();
        for group in &groups {
            group.announce_presence().await;
        }
        groups.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryRepository;
    use huddle_core::{Durability, Record, Stamp};
    use serde_json::json;

    fn group() -> RoomGroup {
        RoomGroup::new(RoomId::new("board"), 16, Arc::new(MemoryRepository::new()))
    }

    fn meta(name: &str, joined_at: u64) -> PresenceMeta {
        PresenceMeta::with_joined_at(PeerId::random(), name, joined_at)
    }

    fn durable_put(id: &str, counter: u64, peer: PeerId) -> Mutation {
        Mutation::Put {
            record: Record::new(id, "shape", json!({"n": counter}), peer),
            stamp: Stamp::new(counter, peer),
            durability: Durability::Durable,
        }
    }

    #[tokio::test]
    async fn test_track_emits_join_then_sync() {
        let group = group();
        let (alice, mut rx) = group.track(meta("Alice", 1)).await;

        assert_eq!(*rx.recv().await.unwrap(), ServerFrame::PresenceJoin(alice.meta.clone()));
        assert_eq!(*rx.recv().await.unwrap(), ServerFrame::PresenceSync(vec![alice.meta]));
        assert_eq!(group.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_assigns_join_order() {
        let group = group();
        // Bob's clock runs far behind Alice's.
        let (alice, _rx_a) = group.track(meta("Alice", u64::MAX / 2)).await;
        let (bob, _rx_b) = group.track(meta("Bob", 1)).await;

        assert!(alice.meta.precedes(&bob.meta));
        assert_eq!(group.members().await, vec![alice.meta, bob.meta]);
    }

    #[tokio::test]
    async fn test_untrack_announces_leave() {
        let group = group();
        let (alice, _rx_a) = group.track(meta("Alice", 1)).await;
        let (bob, mut rx_b) = group.track(meta("Bob", 2)).await;
        // Bob's own join + sync
        rx_b.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        group.untrack(&alice).await;
        assert_eq!(*rx_b.recv().await.unwrap(), ServerFrame::PresenceLeave(alice.meta.peer_id));
        assert_eq!(*rx_b.recv().await.unwrap(), ServerFrame::PresenceSync(vec![bob.meta]));

        assert!(group.untrack(&alice).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_untrack_keeps_rejoined_member() {
        let group = group();
        let me = meta("Alice", 1);
        let (old, _old_rx) = group.track(me.clone()).await;
        let (new, mut new_rx) = group.track(me.clone()).await;
        assert_ne!(old.token, new.token);
        while new_rx.try_recv().is_ok() {}

        // The old connection's cleanup runs after the new join.
        assert!(group.untrack(&old).await.is_none());
        assert!(group.has_member(&me.peer_id).await);
        assert!(new_rx.try_recv().is_err());

        assert!(group.untrack(&new).await.is_some());
        assert!(!group.has_member(&me.peer_id).await);
    }

    #[tokio::test]
    async fn test_subscriber_sees_write_racing_the_load() {
        let group = group();
        let peer = PeerId::random();

        let mut rx = group.subscribe();
        let loaded = group.load().unwrap();
        // Another member persists before the joiner is admitted.
        let m = durable_put("shape-1", 1, peer);
        group.persist(&m).unwrap();
        group.admit(meta("Late", 2)).await;

        assert!(loaded.is_empty());
        assert_eq!(*rx.recv().await.unwrap(), ServerFrame::Durable(m));
    }

    #[tokio::test]
    async fn test_resync_after_lag() {
        let group = RoomGroup::new(RoomId::new("board"), 2, Arc::new(MemoryRepository::new()));
        let peer = PeerId::random();
        let (_, mut rx) = group.track(meta("Slow", 1)).await;

        let writes: Vec<Mutation> = (1..=5).map(|i| durable_put(&format!("s{i}"), i, peer)).collect();
        for m in &writes {
            group.persist(m).unwrap();
        }
        let removal = Mutation::Delete {
            id: "s5".into(),
            originator: peer,
            stamp: Stamp::new(6, peer),
            durability: Durability::Durable,
        };
        group.persist(&removal).unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));

        let frames = group.resync().await.unwrap();
        let mut expected = writes[..4].to_vec();
        expected.push(removal);
        assert_eq!(frames[0], ServerFrame::Loaded(expected));
        assert!(matches!(&frames[1], ServerFrame::PresenceSync(members) if members.len() == 1));
    }

    #[tokio::test]
    async fn test_publish_reaches_everyone() {
        let group = group();
        let (alice, mut rx1) = group.track(meta("Alice", 1)).await;
        let (_, mut rx2) = group.track(meta("Bob", 2)).await;
        let alice = alice.meta;

        let message = BroadcastMessage::Mutation(Mutation::Delete {
            id: "x".into(),
            originator: alice.peer_id,
            stamp: Stamp::new(1, alice.peer_id),
            durability: Durability::Ephemeral,
        });
        assert_eq!(group.publish(alice.peer_id, message), 2);

        let mut last1 = None;
        while let Ok(frame) = rx1.try_recv() {
            last1 = Some(frame);
        }
        let mut last2 = None;
        while let Ok(frame) = rx2.try_recv() {
            last2 = Some(frame);
        }
        assert!(matches!(last1.as_deref(), Some(ServerFrame::Broadcast { .. })));
        assert_eq!(last1, last2);
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let group = group();
        let peer = PeerId::random();
        let m = Mutation::Put {
            record: Record::new("shape-1", "shape", json!({"x": 1}), peer),
            stamp: Stamp::new(1, peer),
            durability: Durability::Durable,
        };

        group.persist(&m).unwrap();
        assert_eq!(group.load().unwrap(), vec![m]);
        assert_eq!(group.stats().await.durable_writes, 1);
    }

    #[tokio::test]
    async fn test_persist_rejects_ephemeral() {
        let group = group();
        let peer = PeerId::random();
        let m = Mutation::Put {
            record: Record::new("cam", "camera", json!({}), peer),
            stamp: Stamp::new(1, peer),
            durability: Durability::Ephemeral,
        };

        assert!(group.persist(&m).is_err());
        assert_eq!(group.stats().await.failed_writes, 1);
        assert!(group.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_receivers_counts_drop() {
        let group = group();
        group.announce_presence().await;
        let stats = group.stats().await;
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_registry_get_or_create() {
        let registry = RoomRegistry::new(16, Arc::new(MemoryRepository::new()));
        let room = RoomId::new("board");

        let g1 = registry.get_or_create(&room).await;
        let g2 = registry.get_or_create(&room).await;
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_cleanup() {
        let registry = RoomRegistry::new(16, Arc::new(MemoryRepository::new()));
        let room = RoomId::new("board");
        let group = registry.get_or_create(&room).await;
        let (alice, _rx) = group.track(meta("Alice", 1)).await;

        assert!(!registry.remove_if_empty(&room).await);
        group.untrack(&alice).await;
        assert!(registry.remove_if_empty(&room).await);
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_registry_rooms_share_repository() {
        let registry = RoomRegistry::new(16, Arc::new(MemoryRepository::new()));
        let room = RoomId::new("board");
        let peer = PeerId::random();
        let m = Mutation::Put {
            record: Record::new("a", "shape", json!(1), peer),
            stamp: Stamp::new(1, peer),
            durability: Durability::Durable,
        };

        registry.get_or_create(&room).await.persist(&m).unwrap();
        registry.remove_if_empty(&room).await;

        // A re-opened room sees what the closed one stored.
        let reopened = registry.get_or_create(&room).await;
        assert_eq!(reopened.load().unwrap().len(), 1);
        assert_eq!(registry.repository().rooms().unwrap(), vec![room]);
    }
}
