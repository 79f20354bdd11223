//! Wire protocol between room participants and the relay.
//!
//! Frames are bincode-encoded (`bincode::serde`, standard config):
//! ```text
//!  client ──► relay                     relay ──► client
//!  ───────────────────                  ──────────────────────────────
//!  Join { room, meta }                  Loaded(records)
//!  Leave                                Durable(mutation)
//!  Broadcast(message)                   Broadcast { from, message }
//!  Persist(mutation)                    PresenceJoin / Leave / Sync
//!  Ping                                 PersistFailed { id, reason }
//!                                       Pong / Rejected(reason)
//! ```
//!
//! Cursor updates, record mutations and audio signaling all share the one
//! ephemeral [`BroadcastMessage`] type; there is no second channel.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use huddle_core::{Mutation, PeerId, RecordId, RoomId};

use crate::cursor::CursorState;
use crate::error::ProtocolError;
use crate::mesh::SignalEnvelope;

/// Presence metadata a peer tracks itself with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMeta {
    pub peer_id: PeerId,
    pub display_name: String,
    /// Milliseconds since the Unix epoch at room entry.
    pub joined_at: u64,
}

impl PresenceMeta {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            joined_at: now_millis(),
        }
    }

    /// Explicit join time (for testing).
    pub fn with_joined_at(peer_id: PeerId, display_name: impl Into<String>, joined_at: u64) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            joined_at,
        }
    }

    /// Whether `self` was in the room before `other`.
    ///
    /// Ties on the timestamp fall back to the peer id, so exactly one of
    /// `a.precedes(b)` and `b.precedes(a)` holds for distinct peers.
    pub fn precedes(&self, other: &PresenceMeta) -> bool {
        (self.joined_at, self.peer_id) < (other.joined_at, other.peer_id)
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Ephemeral fan-out payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BroadcastMessage {
    Mutation(Mutation),
    Cursor(CursorState),
    Signal(SignalEnvelope),
}

impl BroadcastMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastMessage::Mutation(_) => "mutation",
            BroadcastMessage::Cursor(_) => "cursor",
            BroadcastMessage::Signal(_) => "signal",
        }
    }
}

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Join { room: RoomId, meta: PresenceMeta },
    Leave,
    Broadcast(BroadcastMessage),
    Persist(Mutation),
    Ping,
}

/// Relay → client (also the in-process hub's fan-out unit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// Durable room state at subscribe time.
    Loaded(Vec<Mutation>),
    /// Change notification for a persisted write.
    Durable(Mutation),
    Broadcast {
        from: PeerId,
        message: BroadcastMessage,
    },
    PresenceJoin(PresenceMeta),
    PresenceLeave(PeerId),
    /// Authoritative member list.
    PresenceSync(Vec<PresenceMeta>),
    PersistFailed {
        id: RecordId,
        reason: String,
    },
    Pong,
    Rejected(String),
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Serialize to binary wire format.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Deserialize from binary wire format.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{CursorColor, Vec2};
    use crate::mesh::SignalPayload;
    use huddle_core::{Durability, Record, Stamp};
    use serde_json::json;

    #[test]
    fn test_precedes_is_antisymmetric() {
        let a = PresenceMeta::with_joined_at(PeerId::random(), "A", 100);
        let b = PresenceMeta::with_joined_at(PeerId::random(), "B", 200);
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));

        let c = PresenceMeta::with_joined_at(PeerId::random(), "C", 100);
        assert_ne!(a.precedes(&c), c.precedes(&a));
        assert!(!a.precedes(&a));
    }

    #[test]
    fn test_mutation_frame_carries_json_payload() {
        let peer = PeerId::random();
        let frame = ClientFrame::Persist(Mutation::Put {
            record: Record::new("shape-1", "shape", json!({"props": {"w": 10, "tags": ["a"]}}), peer),
            stamp: Stamp::new(3, peer),
            durability: Durability::Durable,
        });

        let decoded = ClientFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_broadcast_frame_variants() {
        let from = PeerId::random();
        let to = PeerId::random();
        let frames = vec![
            ServerFrame::Broadcast {
                from,
                message: BroadcastMessage::Cursor(CursorState {
                    peer_id: from,
                    display_name: "Alice".into(),
                    color: CursorColor::default(),
                    position: Vec2::new(1.5, -2.0),
                    timestamp: 9,
                }),
            },
            ServerFrame::Broadcast {
                from,
                message: BroadcastMessage::Signal(SignalEnvelope {
                    payload: SignalPayload::Offer { sdp: "v=0".into() },
                    source_peer: from,
                    target_peer: to,
                }),
            },
            ServerFrame::PresenceSync(vec![PresenceMeta::with_joined_at(from, "Alice", 1)]),
        ];

        for frame in frames {
            let decoded = ServerFrame::decode(&frame.encode().unwrap()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ServerFrame::decode(&garbage).is_err());
    }

    #[test]
    fn test_cursor_frame_size_small() {
        let from = PeerId::random();
        let frame = ClientFrame::Broadcast(BroadcastMessage::Cursor(CursorState {
            peer_id: from,
            display_name: "Al".into(),
            color: CursorColor::default(),
            position: Vec2::new(100.0, 200.0),
            timestamp: 1,
        }));
        let encoded = frame.encode().unwrap();
        assert!(encoded.len() < 64, "Cursor frame too large: {} bytes", encoded.len());
    }
}
