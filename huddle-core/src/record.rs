//! Record model shared by every room participant.
//!
//! A [`Record`] is one addressable unit of document state. Its payload is an
//! opaque JSON value owned by the editing surface; the sync layer only looks
//! at the type tag, and only once, to decide the record's [`Durability`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Identity of one connected client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Fresh random peer id (one per room session).
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a room: the scope of a channel, document, presence set and mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of a record inside a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque structured payload.
///
/// Serialized as a JSON string so that non self-describing binary codecs
/// (bincode) can carry arbitrary JSON.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload(serde_json::Value);

impl Payload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        serde_json::from_str(&raw)
            .map(Payload)
            .map_err(serde::de::Error::custom)
    }
}

/// One unit of shared document state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub type_tag: String,
    pub payload: Payload,
    /// Peer that produced this version of the record.
    pub originator: PeerId,
}

impl Record {
    pub fn new(
        id: impl Into<RecordId>,
        type_tag: impl Into<String>,
        payload: impl Into<Payload>,
        originator: PeerId,
    ) -> Self {
        Self {
            id: id.into(),
            type_tag: type_tag.into(),
            payload: payload.into(),
            originator,
        }
    }
}

/// Whether a mutation may reach the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Durability {
    Durable,
    Ephemeral,
}

impl Durability {
    pub fn is_durable(self) -> bool {
        matches!(self, Durability::Durable)
    }
}

/// Type tags whose records live only on the broadcast path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralTags {
    tags: HashSet<String>,
}

impl EphemeralTags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// Empty set: every record is durable.
    pub fn none() -> Self {
        Self { tags: HashSet::new() }
    }

    pub fn classify(&self, type_tag: &str) -> Durability {
        if self.tags.contains(type_tag) {
            Durability::Ephemeral
        } else {
            Durability::Durable
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

impl Default for EphemeralTags {
    /// Per-user view state of the editing surface.
    fn default() -> Self {
        Self::new([
            "instance",
            "instance_page_state",
            "instance_presence",
            "camera",
            "pointer",
        ])
    }
}
