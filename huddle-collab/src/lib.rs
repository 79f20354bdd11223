//! # huddle-collab — realtime rooms over a relay
//!
//! Everything around the document model: the room channel, presence,
//! live cursors, the peer-to-peer audio mesh, reconnection, and the relay
//! with its durable store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌──────────────┐
//! │ RoomSession  │ ◄──────────────────► │ RelayServer  │
//! │ (per user)   │    bincode frames    │ (central)    │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │ SyncEngine   │                      │ RoomGroup    │
//! │ Presence     │                      │ (fan-out)    │
//! │ Cursors      │                      └──────┬───────┘
//! │ AudioMesh    │                             │
//! └──────────────┘                      ┌──────┴───────┐
//!                                       │ Repository   │
//!                                       │ (RocksDB)    │
//!                                       └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — per-participant event dispatcher
//! - [`channel`] — room channel trait, in-process hub, WebSocket client
//! - [`protocol`] — wire frames (bincode)
//! - [`presence`] — membership view and join/leave transitions
//! - [`cursor`] — throttled cursor broadcast and remote cursor table
//! - [`mesh`] — full-mesh audio signaling over the room channel
//! - [`reconnect`] — retry state machine and offline write queue
//! - [`broadcast`] — relay-side room fan-out
//! - [`persistence`] — durable record repository (RocksDB + LZ4)
//! - [`relay`] — WebSocket relay server

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod mesh;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod reconnect;
pub mod relay;
pub mod session;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, RoomGroup, RoomRegistry};
pub use channel::{
    Channel, ChannelEvent, ChannelStatus, MemoryChannel, MemoryHub, PresenceEvent, WsChannel,
    WsConfig,
};
pub use config::SessionConfig;
pub use cursor::{CursorColor, CursorService, CursorState, Throttle, Vec2};
pub use error::{
    MediaAccessError, PersistenceError, ProtocolError, RelayError, SessionClosed, SignalingError,
    TransportError,
};
pub use event::{Command, SessionEvent, SessionNotice};
pub use mesh::{
    AudioMesh, IceCandidate, LocalAudioTrack, MediaBackend, MeshStatus, NoMedia, PeerLink,
    SignalEnvelope, SignalPayload,
};
pub use persistence::{MemoryRepository, Repository, RocksRepository, StoreConfig};
pub use presence::{PresenceManager, PresenceTransition};
pub use protocol::{BroadcastMessage, ClientFrame, PresenceMeta, ServerFrame};
pub use reconnect::{ChannelSession, OfflineQueue, ReconnectPolicy, RetryDecision};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{RoomSession, SessionContext, SessionHandle};
