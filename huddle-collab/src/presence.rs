//! Room membership as seen by one participant.
//!
//! Join/leave events are incremental; a sync carries the authoritative
//! member list and is diffed against the current view so that consumers
//! only ever see `Joined` / `Left` transitions.

use std::collections::HashMap;

use huddle_core::PeerId;

use crate::protocol::PresenceMeta;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    Joined(PresenceMeta),
    Left(PeerId),
}

impl PresenceTransition {
    pub fn peer(&self) -> PeerId {
        match self {
            PresenceTransition::Joined(meta) => meta.peer_id,
            PresenceTransition::Left(peer) => *peer,
        }
    }
}

#[derive(Debug)]
pub struct PresenceManager {
    local: PeerId,
    members: HashMap<PeerId, PresenceMeta>,
}

impl PresenceManager {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            members: HashMap::new(),
        }
    }

    /// A repeated join refreshes the metadata without a transition.
    pub fn on_join(&mut self, meta: PresenceMeta) -> Option<PresenceTransition> {
        match self.members.insert(meta.peer_id, meta.clone()) {
            Some(_) => None,
            None => Some(PresenceTransition::Joined(meta)),
        }
    }

    /// Unknown peers are ignored, so the count never goes negative.
    pub fn on_leave(&mut self, peer: &PeerId) -> Option<PresenceTransition> {
        self.members
            .remove(peer)
            .map(|meta| PresenceTransition::Left(meta.peer_id))
    }

    /// Replace the view with `snapshot`, returning departures then arrivals.
    pub fn on_sync(&mut self, snapshot: Vec<PresenceMeta>) -> Vec<PresenceTransition> {
        let next: HashMap<PeerId, PresenceMeta> =
            snapshot.into_iter().map(|m| (m.peer_id, m)).collect();

        let mut left: Vec<PeerId> = self
            .members
            .keys()
            .filter(|peer| !next.contains_key(peer))
            .copied()
            .collect();
        left.sort();

        let mut joined: Vec<PresenceMeta> = next
            .values()
            .filter(|m| !self.members.contains_key(&m.peer_id))
            .cloned()
            .collect();
        joined.sort_by_key(|m| (m.joined_at, m.peer_id));

        self.members = next;

        left.into_iter()
            .map(PresenceTransition::Left)
            .chain(joined.into_iter().map(PresenceTransition::Joined))
            .collect()
    }

    /// Everyone present, the local peer included.
    pub fn peer_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains_key(peer)
    }

    pub fn meta(&self, peer: &PeerId) -> Option<&PresenceMeta> {
        self.members.get(peer)
    }

    pub fn remote_peers(&self) -> impl Iterator<Item = &PresenceMeta> {
        let local = self.local;
        self.members.values().filter(move |m| m.peer_id != local)
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }
}
