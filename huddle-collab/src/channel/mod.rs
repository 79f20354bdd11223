//! Room channel abstraction.
//!
//! A [`Channel`] joins one room and yields a stream of [`ChannelEvent`]s:
//!
//! ```text
//!   subscribe(room, meta) ──► mpsc::Receiver<ChannelEvent>
//!                                 │
//!        Status(Connected) ───────┤  once the room is joined
//!        Loaded(records)   ───────┤  durable snapshot
//!        Presence(..)      ───────┤  join / leave / sync
//!        Broadcast{..}     ───────┤  ephemeral fan-out (incl. own echo)
//!        Durable(m)        ───────┤  persisted change notification
//!        Status(Error)     ───────┘  transport lost
//! ```
//!
//! Two implementations: [`MemoryChannel`] (in-process hub, used by tests and
//! embedding) and [`WsChannel`] (WebSocket client of the relay).

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

use huddle_core::{Mutation, PeerId, RecordId, RoomId};

use crate::error::{PersistenceError, TransportError};
use crate::protocol::{BroadcastMessage, PresenceMeta, ServerFrame};

pub use memory::{HubConfig, MemoryChannel, MemoryHub};
pub use ws::{WsChannel, WsConfig};

/// Lifecycle of a room channel as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Error,
    Timeout,
    /// Waiting out the backoff delay before the next attempt.
    Retrying,
    /// Retries exhausted or the room was left.
    Disconnected,
}

impl ChannelStatus {
    pub fn is_failure(self) -> bool {
        matches!(self, ChannelStatus::Error | ChannelStatus::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Join(PresenceMeta),
    Leave(PeerId),
    Sync(Vec<PresenceMeta>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Loaded(Vec<Mutation>),
    Durable(Mutation),
    Broadcast {
        from: PeerId,
        message: BroadcastMessage,
    },
    Presence(PresenceEvent),
    /// A durable write that the far side could not store.
    PersistFailed {
        id: RecordId,
        reason: String,
    },
}

impl ChannelEvent {
    /// Map a relay frame onto the event stream. Keepalive frames map to nothing.
    pub fn from_frame(frame: ServerFrame) -> Option<Self> {
        let event = match frame {
            ServerFrame::Loaded(records) => ChannelEvent::Loaded(records),
            ServerFrame::Durable(mutation) => ChannelEvent::Durable(mutation),
            ServerFrame::Broadcast { from, message } => ChannelEvent::Broadcast { from, message },
            ServerFrame::PresenceJoin(meta) => ChannelEvent::Presence(PresenceEvent::Join(meta)),
            ServerFrame::PresenceLeave(peer) => ChannelEvent::Presence(PresenceEvent::Leave(peer)),
            ServerFrame::PresenceSync(members) => {
                ChannelEvent::Presence(PresenceEvent::Sync(members))
            }
            ServerFrame::PersistFailed { id, reason } => ChannelEvent::PersistFailed { id, reason },
            ServerFrame::Rejected(_) => ChannelEvent::Status(ChannelStatus::Error),
            ServerFrame::Pong => return None,
        };
        Some(event)
    }
}

pub type EventReceiver = mpsc::Receiver<ChannelEvent>;

/// A publish/subscribe connection to one room.
///
/// `broadcast` is fire-and-forget fan-out to every member, the sender
/// included. `persist` writes a durable mutation; the write is later echoed
/// to all members as [`ChannelEvent::Durable`].
#[async_trait]
pub trait Channel: Send {
    async fn subscribe(
        &mut self,
        room: &RoomId,
        meta: &PresenceMeta,
    ) -> Result<EventReceiver, TransportError>;

    /// Leave presence and close. Idempotent.
    async fn unsubscribe(&mut self);

    async fn broadcast(&mut self, message: BroadcastMessage) -> Result<(), TransportError>;

    async fn persist(&mut self, mutation: Mutation) -> Result<(), PersistenceError>;
}
