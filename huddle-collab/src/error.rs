//! Error types, one per failure domain.
//!
//! Each component owns its failures: a transport error drives reconnection,
//! a persistence error is reported and dropped, a signaling error closes one
//! peer link, a media error disables only the audio mesh.

use std::time::Duration;

use huddle_core::{PeerId, RecordId};

/// Wire encode/decode failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Channel-level failures. Handled by the reconnection state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscribe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Not subscribed to a room")]
    NotSubscribed,

    #[error("Rejected by relay: {0}")]
    Rejected(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Durable write failures. Reported at the call site, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Record {0} is ephemeral and cannot be persisted")]
    NotDurable(RecordId),

    #[error("Durable path unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for PersistenceError {
    fn from(e: rocksdb::Error) -> Self {
        PersistenceError::Database(e.to_string())
    }
}

/// Failures scoped to a single peer audio connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("No connection to peer {0}")]
    UnknownPeer(PeerId),

    #[error("Negotiation with {peer} failed: {reason}")]
    Negotiation { peer: PeerId, reason: String },

    #[error("Link to {0} failed")]
    LinkFailed(PeerId),
}

impl SignalingError {
    pub fn peer(&self) -> PeerId {
        match self {
            SignalingError::UnknownPeer(peer)
            | SignalingError::Negotiation { peer, .. }
            | SignalingError::LinkFailed(peer) => *peer,
        }
    }
}

/// Microphone unavailable. Fatal to the audio mesh only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaAccessError {
    #[error("Microphone permission denied")]
    Denied,

    #[error("No audio input device available")]
    NoDevice,

    #[error("Media error: {0}")]
    Other(String),
}

/// Fatal relay failures: the listener or a connection's socket.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// The session task has stopped; commands can no longer be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Session closed")]
pub struct SessionClosed;
