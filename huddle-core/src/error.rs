use crate::record::RecordId;

/// Rejected local edit. Nothing is applied when an edit batch fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("Record id must not be empty")]
    EmptyId,

    #[error("Record {0} has an empty type tag")]
    EmptyTypeTag(RecordId),
}
