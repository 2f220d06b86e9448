//! Error types for the memo store.

use thiserror::Error;

use crate::id::{MemoId, RecordId, SlabId};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in store operations.
///
/// Nothing here crosses the mesh: a failed push is reported to its
/// initiator as a [`PushOutcome`](crate::replication::PushOutcome), and
/// under-replication rides along in a
/// [`ReplicationReport`](crate::replication::ReplicationReport).
#[derive(Debug, Error)]
pub enum Error {
    /// A memo was stored twice on the same slab
    #[error("Duplicate memo: {0} is already stored on this slab")]
    DuplicateMemo(MemoId),

    /// A memo was referenced but is not stored locally
    #[error("Invalid memo: {0} is not stored on this slab")]
    InvalidMemo(MemoId),

    /// A memo could not reach its replica target
    #[error("Under-replicated: {memo} is short {missing} replica(s)")]
    UnderReplicated {
        /// The memo in question
        memo: MemoId,
        /// Replicas still wanted
        missing: usize,
    },

    /// A push was dropped because the destination was full or gone
    #[error("Delivery dropped: {memo} could not be delivered to slab {slab}")]
    DeliveryDropped {
        /// The memo that was pushed
        memo: MemoId,
        /// The intended destination
        slab: SlabId,
    },

    /// A payload field breaks the `$` key convention for references
    #[error("Invalid payload: field {field:?} breaks the '$' reference key convention")]
    InvalidPayload {
        /// The offending key
        field: String,
    },

    /// Record is not known to this slab
    #[error("Unknown record: {0}")]
    UnknownRecord(RecordId),

    /// Malformed slab identifier
    #[error("Invalid slab id: {0:?}")]
    InvalidSlabId(String),

    /// Malformed memo or record identifier
    #[error("Invalid entity id: {0:?}")]
    InvalidEntityId(String),

    /// Another live slab already registered under this id
    #[error("Duplicate slab: {0} is already registered with this mesh")]
    DuplicateSlab(SlabId),

    /// Configuration rejected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A blocking fresh read gave up waiting for causal prerequisites
    #[error("Stale read: record {record} did not catch up with its context")]
    Stale {
        /// The record being read
        record: RecordId,
    },

    /// Wire encoding error
    #[error("Wire error: {0}")]
    Wire(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is a soft condition that callers log and move past.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Error::UnderReplicated { .. } | Error::DeliveryDropped { .. } | Error::Stale { .. }
        )
    }
}
