//! # huddle-core — document model for realtime rooms
//!
//! Records, Lamport stamps, the last-writer-wins [`DocumentStore`] and the
//! [`DocumentSyncEngine`] that funnels local edits and remote mutations
//! through a single idempotent merge. No I/O lives here; transport,
//! presence and media are in `huddle-collab`.

pub mod clock;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod record;
pub mod store;

pub use clock::{LamportClock, Stamp};
pub use engine::{DocumentSyncEngine, Outbound, RemoteOutcome, Via};
pub use error::EditError;
pub use mutation::{LocalEdit, Mutation};
pub use record::{Durability, EphemeralTags, Payload, PeerId, Record, RecordId, RoomId};
pub use store::{DocumentStore, MergeOutcome};
