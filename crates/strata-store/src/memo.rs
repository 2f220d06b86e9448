//! Immutable memos: the unit of storage and replication.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::id::{EntityId, MemoId, RecordId};
use crate::value::{validate_payload, Payload, Value};

/// An immutable fact belonging to one record.
///
/// `parents` is the head set of the record as the minting slab saw it.
/// Nothing about a memo changes after construction. The transient
/// "evicting" state lives in the holding slab's LRU bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Memo {
    id: MemoId,
    record_id: RecordId,
    parents: BTreeSet<MemoId>,
    payload: Payload,
    replica_target: usize,
}

impl Memo {
    pub fn new(
        id: MemoId,
        record_id: RecordId,
        parents: BTreeSet<MemoId>,
        payload: Payload,
        replica_target: usize,
    ) -> Self {
        Self {
            id,
            record_id,
            parents,
            payload,
            replica_target,
        }
    }

    pub fn id(&self) -> &MemoId {
        &self.id
    }

    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    pub fn parents(&self) -> &BTreeSet<MemoId> {
        &self.parents
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Total copies this memo wants across the mesh.
    pub fn replica_target(&self) -> usize {
        self.replica_target
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Memo ids named by `Ref` payload values.
    pub fn references(&self) -> impl Iterator<Item = &MemoId> {
        self.payload.values().filter_map(|v| match v {
            Value::Ref(EntityId::Memo(id)) => Some(id),
            _ => None,
        })
    }

    /// Ids whose holders this memo's slab must keep track of: its parents,
    /// for fetching evicted ancestors back, and its references.
    pub fn dependencies(&self) -> impl Iterator<Item = &MemoId> {
        self.parents.iter().chain(self.references())
    }

    /// Whether the payload can cross the wire unchanged.
    pub fn validate(&self) -> Result<()> {
        validate_payload(&self.payload)
    }

    /// Further copies wanted given `known_replicas` holders (self included).
    ///
    /// A memo being evicted asks for one extra so that the copy about to
    /// go away is not counted towards the target.
    pub fn desired_replicas(&self, known_replicas: usize, evicting: bool) -> usize {
        (self.replica_target + usize::from(evicting)).saturating_sub(known_replicas)
    }
}
