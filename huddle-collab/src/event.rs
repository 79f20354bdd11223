//! Session inputs and outputs.
//!
//! Everything that can happen to a room session is a [`SessionEvent`];
//! everything a UI needs to hear about is a [`SessionNotice`]. Channel
//! traffic is translated into events by [`SessionEvent::from_channel`].

use huddle_core::{LocalEdit, Mutation, PeerId, Record, RecordId, Via};

use crate::channel::{ChannelEvent, ChannelStatus, PresenceEvent};
use crate::cursor::{CursorState, Vec2};
use crate::mesh::SignalEnvelope;
use crate::protocol::{BroadcastMessage, PresenceMeta};

/// Closed set of inputs to [`RoomSession::dispatch`](crate::session::RoomSession::dispatch).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RemotePut { mutation: Mutation, via: Via },
    RemoteDelete { mutation: Mutation, via: Via },
    LocalPut(LocalEdit),
    LocalDelete(LocalEdit),
    Join(PresenceMeta),
    Leave(PeerId),
    Sync(Vec<PresenceMeta>),
    ChannelStatusChanged(ChannelStatus),
    SignalReceived(SignalEnvelope),
    CursorReceived(CursorState),
    PointerMoved(Vec2),
    PersistFailed { id: RecordId, reason: String },
}

impl SessionEvent {
    fn remote(mutation: Mutation, via: Via) -> Self {
        if mutation.is_delete() {
            SessionEvent::RemoteDelete { mutation, via }
        } else {
            SessionEvent::RemotePut { mutation, via }
        }
    }

    /// Translate one channel event. A broadcast whose inner sender does not
    /// match the relay-stamped `from` is dropped.
    pub fn from_channel(event: ChannelEvent) -> Vec<SessionEvent> {
        match event {
            ChannelEvent::Status(status) => vec![SessionEvent::ChannelStatusChanged(status)],
            ChannelEvent::Loaded(mutations) => mutations
                .into_iter()
                .map(|m| SessionEvent::remote(m, Via::Loaded))
                .collect(),
            ChannelEvent::Durable(mutation) => vec![SessionEvent::remote(mutation, Via::Durable)],
            ChannelEvent::Broadcast { from, message } => match message {
                BroadcastMessage::Mutation(m) => vec![SessionEvent::remote(m, Via::Broadcast)],
                BroadcastMessage::Cursor(state) if state.peer_id == from => {
                    vec![SessionEvent::CursorReceived(state)]
                }
                BroadcastMessage::Signal(env) if env.source_peer == from => {
                    vec![SessionEvent::SignalReceived(env)]
                }
                other => {
                    log::warn!("Dropping {} from {} with mismatched sender", other.kind(), from.short());
                    Vec::new()
                }
            },
            ChannelEvent::Presence(PresenceEvent::Join(meta)) => vec![SessionEvent::Join(meta)],
            ChannelEvent::Presence(PresenceEvent::Leave(peer)) => vec![SessionEvent::Leave(peer)],
            ChannelEvent::Presence(PresenceEvent::Sync(members)) => vec![SessionEvent::Sync(members)],
            ChannelEvent::PersistFailed { id, reason } => {
                vec![SessionEvent::PersistFailed { id, reason }]
            }
        }
    }
}

/// What the UI is told.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    RecordChanged(Record),
    RecordRemoved(RecordId),
    CursorMoved(CursorState),
    CursorRemoved(PeerId),
    PeerCountChanged(usize),
    StatusChanged(ChannelStatus),
    MediaUnavailable(String),
    PersistFailed { id: RecordId, reason: String },
    PeerLinkFailed { peer: PeerId, reason: String },
    EditRejected(String),
}

/// Requests from the UI to a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Edit(Vec<LocalEdit>),
    PointerMoved(Vec2),
    SetMuted(bool),
    /// Tear down and resubscribe with a fresh retry budget.
    Reconnect,
    Leave,
}
