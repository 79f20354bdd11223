//! Mutations: the only way record state changes.
//!
//! Put and Delete are distinct messages; a delete is never encoded as a put
//! of an empty record.

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;
use crate::record::{Durability, PeerId, Payload, Record, RecordId};

/// A stamped change to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put {
        record: Record,
        stamp: Stamp,
        durability: Durability,
    },
    Delete {
        id: RecordId,
        originator: PeerId,
        stamp: Stamp,
        durability: Durability,
    },
}

impl Mutation {
    pub fn id(&self) -> &RecordId {
        match self {
            Mutation::Put { record, .. } => &record.id,
            Mutation::Delete { id, .. } => id,
        }
    }

    pub fn originator(&self) -> PeerId {
        match self {
            Mutation::Put { record, .. } => record.originator,
            Mutation::Delete { originator, .. } => *originator,
        }
    }

    pub fn stamp(&self) -> Stamp {
        match self {
            Mutation::Put { stamp, .. } | Mutation::Delete { stamp, .. } => *stamp,
        }
    }

    pub fn durability(&self) -> Durability {
        match self {
            Mutation::Put { durability, .. } | Mutation::Delete { durability, .. } => *durability,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Mutation::Delete { .. })
    }
}

/// An unstamped edit coming from the local editing surface.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    Put {
        id: RecordId,
        type_tag: String,
        payload: Payload,
    },
    Delete {
        id: RecordId,
    },
}

impl LocalEdit {
    pub fn put(id: impl Into<RecordId>, type_tag: impl Into<String>, payload: impl Into<Payload>) -> Self {
        LocalEdit::Put {
            id: id.into(),
            type_tag: type_tag.into(),
            payload: payload.into(),
        }
    }

    pub fn delete(id: impl Into<RecordId>) -> Self {
        LocalEdit::Delete { id: id.into() }
    }

    pub fn id(&self) -> &RecordId {
        match self {
            LocalEdit::Put { id, .. } | LocalEdit::Delete { id } => id,
        }
    }
}
