//! In-process channel: every participant shares one [`RoomRegistry`].
//!
//! ```text
//!  MemoryChannel ──track/publish/persist──► RoomGroup
//!        ▲                                     │
//!        └──── forwarder task ◄── broadcast::Receiver<Arc<ServerFrame>>
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use huddle_core::{Mutation, PeerId, RoomId};

use super::{Channel, ChannelEvent, ChannelStatus, EventReceiver};
use crate::broadcast::{Admission, RoomGroup, RoomRegistry};
use crate::error::{PersistenceError, TransportError};
use crate::persistence::{MemoryRepository, Repository};
use crate::protocol::{BroadcastMessage, PresenceMeta, ServerFrame};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per member in a room.
    pub broadcast_capacity: usize,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            event_capacity: 1024,
        }
    }
}

/// Shared rendezvous for in-process channels.
#[derive(Clone)]
pub struct MemoryHub {
    registry: Arc<RoomRegistry>,
    config: HubConfig,
    online: Arc<AtomicBool>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_repository(HubConfig::default(), Arc::new(MemoryRepository::new()))
    }

    pub fn with_repository(config: HubConfig, repository: Arc<dyn Repository>) -> Self {
        Self {
            registry: Arc::new(RoomRegistry::new(config.broadcast_capacity, repository)),
            config,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel {
            hub: self.clone(),
            joined: None,
            forwarder: None,
        }
    }

    /// While offline, every subscribe attempt fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's view of a [`MemoryHub`].
pub struct MemoryChannel {
    hub: MemoryHub,
    joined: Option<(Arc<RoomGroup>, Admission)>,
    forwarder: Option<JoinHandle<()>>,
}

impl MemoryChannel {
    fn group(&self) -> Option<(&Arc<RoomGroup>, PeerId)> {
        self.joined
            .as_ref()
            .map(|(group, admission)| (group, admission.meta.peer_id))
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn subscribe(
        &mut self,
        room: &RoomId,
        meta: &PresenceMeta,
    ) -> Result<EventReceiver, TransportError> {
        self.unsubscribe().await;
        if !self.hub.is_online() {
            return Err(TransportError::ConnectionFailed("hub offline".into()));
        }

        let group = self.hub.registry.get_or_create(room).await;
        let rx = group.subscribe();
        let loaded = group
            .load()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (tx, events) = mpsc::channel(self.hub.config.event_capacity);
        let closed = |_| TransportError::ChannelClosed;
        tx.send(ChannelEvent::Status(ChannelStatus::Connected)).await.map_err(closed)?;
        tx.send(ChannelEvent::Loaded(loaded)).await.map_err(closed)?;

        let admission = group.admit(meta.clone()).await;
        self.forwarder = Some(tokio::spawn(forward(group.clone(), rx, tx, meta.peer_id)));
        self.joined = Some((group, admission));
        Ok(events)
    }

    async fn unsubscribe(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
        if let Some((group, admission)) = self.joined.take() {
            group.untrack(&admission).await;
            self.hub.registry.remove_if_empty(group.room()).await;
        }
    }

    async fn broadcast(&mut self, message: BroadcastMessage) -> Result<(), TransportError> {
        let (group, peer) = self.group().ok_or(TransportError::NotSubscribed)?;
        group.publish(peer, message);
        Ok(())
    }

    async fn persist(&mut self, mutation: Mutation) -> Result<(), PersistenceError> {
        let (group, _) = self
            .group()
            .ok_or_else(|| PersistenceError::Unavailable("not subscribed".into()))?;
        group.persist(&mutation).map(|_| ())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

async fn forward(
    group: Arc<RoomGroup>,
    mut rx: broadcast::Receiver<Arc<ServerFrame>>,
    tx: mpsc::Sender<ChannelEvent>,
    peer: PeerId,
) {
    loop {
        let frames = match rx.recv().await {
            Ok(frame) => vec![(*frame).clone()],
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Peer {} lagged by {n} frames, resyncing", peer.short());
                match group.resync().await {
                    Ok(frames) => frames,
                    Err(e) => {
                        log::error!("Resync of {} failed: {e}", group.room());
                        report_error(&tx, peer).await;
                        break;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                report_error(&tx, peer).await;
                break;
            }
        };
        for event in frames.into_iter().filter_map(ChannelEvent::from_frame) {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

async fn report_error(tx: &mpsc::Sender<ChannelEvent>, peer: PeerId) {
    if tx.send(ChannelEvent::Status(ChannelStatus::Error)).await.is_err() {
        log::debug!("Session of {} already gone", peer.short());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PresenceEvent;
    use huddle_core::{Durability, Record, Stamp};
    use serde_json::json;

    async fn next(events: &mut EventReceiver) -> ChannelEvent {
        events.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_sequence() {
        let hub = MemoryHub::new();
        let mut channel = hub.channel();
        let meta = PresenceMeta::with_joined_at(PeerId::random(), "Alice", 1);

        let mut events = channel.subscribe(&RoomId::new("board"), &meta).await.unwrap();
        assert_eq!(next(&mut events).await, ChannelEvent::Status(ChannelStatus::Connected));
        assert_eq!(next(&mut events).await, ChannelEvent::Loaded(vec![]));
        let ChannelEvent::Presence(PresenceEvent::Join(joined)) = next(&mut events).await else {
            panic!("expected own join");
        };
        assert_eq!(joined.peer_id, meta.peer_id);
        assert_eq!(joined.display_name, "Alice");
        assert_eq!(
            next(&mut events).await,
            ChannelEvent::Presence(PresenceEvent::Sync(vec![joined]))
        );
    }

    #[tokio::test]
    async fn test_offline_hub_refuses() {
        let hub = MemoryHub::new();
        hub.set_online(false);
        let mut channel = hub.channel();
        let meta = PresenceMeta::new(PeerId::random(), "Alice");

        let result = channel.subscribe(&RoomId::new("board"), &meta).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_persist_loaded_by_next_subscriber() {
        let hub = MemoryHub::new();
        let room = RoomId::new("board");
        let alice = PresenceMeta::new(PeerId::random(), "Alice");
        let mut a = hub.channel();
        let _events = a.subscribe(&room, &alice).await.unwrap();

        let m = Mutation::Put {
            record: Record::new("shape-1", "shape", json!(1), alice.peer_id),
            stamp: Stamp::new(1, alice.peer_id),
            durability: Durability::Durable,
        };
        a.persist(m.clone()).await.unwrap();

        let mut b = hub.channel();
        let mut events = b
            .subscribe(&room, &PresenceMeta::new(PeerId::random(), "Bob"))
            .await
            .unwrap();
        next(&mut events).await;
        assert_eq!(next(&mut events).await, ChannelEvent::Loaded(vec![m]));
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_presence() {
        let hub = MemoryHub::new();
        let room = RoomId::new("board");
        let mut channel = hub.channel();
        let _events = channel
            .subscribe(&room, &PresenceMeta::new(PeerId::random(), "Alice"))
            .await
            .unwrap();
        assert_eq!(hub.registry().room_count().await, 1);

        channel.unsubscribe().await;
        channel.unsubscribe().await;
        assert_eq!(hub.registry().room_count().await, 0);
        assert!(matches!(
            channel.broadcast(BroadcastMessage::Mutation(Mutation::Delete {
                id: "x".into(),
                originator: PeerId::random(),
                stamp: Stamp::new(1, PeerId::random()),
                durability: Durability::Ephemeral,
            }))
            .await,
            Err(TransportError::NotSubscribed)
        ));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_catches_up() {
        let config = HubConfig {
            broadcast_capacity: 2,
            event_capacity: 64,
        };
        let hub = MemoryHub::with_repository(config, Arc::new(MemoryRepository::new()));
        let room = RoomId::new("board");
        let alice = PresenceMeta::new(PeerId::random(), "Alice");
        let mut a = hub.channel();
        let _a_events = a.subscribe(&room, &alice).await.unwrap();
        let mut b = hub.channel();
        let mut b_events = b
            .subscribe(&room, &PresenceMeta::new(PeerId::random(), "Bob"))
            .await
            .unwrap();

        // Bob's forwarder has not run yet, so these overrun his receiver.
        let writes: Vec<Mutation> = (1..=5)
            .map(|i| Mutation::Put {
                record: Record::new(format!("s{i}"), "shape", json!(i), alice.peer_id),
                stamp: Stamp::new(i, alice.peer_id),
                durability: Durability::Durable,
            })
            .collect();
        for m in &writes {
            a.persist(m.clone()).await.unwrap();
        }

        let caught_up = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if let ChannelEvent::Loaded(loaded) = next(&mut b_events).await {
                    if loaded.len() == writes.len() {
                        return loaded;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(caught_up, writes);
    }
}
