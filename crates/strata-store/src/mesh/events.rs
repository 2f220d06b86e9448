//! Mesh events for external observers.

use serde::{Deserialize, Serialize};

use crate::id::{MemoId, SlabId};
use crate::peering::PeeringDeltas;
use crate::replication::DropReason;

/// Something observable happened on the mesh.
///
/// Times are milliseconds since the mesh was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MeshEvent {
    /// A memo push left its origin
    MemoEmitted {
        from: SlabId,
        to: SlabId,
        memo_id: MemoId,
        emit_ms: u64,
        /// Scheduled arrival; unset while the mesh is disconnected
        deliver_ms: Option<u64>,
    },

    /// A memo push reached its destination
    MemoDelivered {
        slab: SlabId,
        from: SlabId,
        memo_id: MemoId,
        delivered_ms: u64,
    },

    /// A memo push was dropped
    MemoDropped {
        from: SlabId,
        to: SlabId,
        memo_id: MemoId,
        reason: DropReason,
        at_ms: u64,
    },

    /// A slab asked another for memos it is missing
    MemoRequested {
        from: SlabId,
        to: SlabId,
        memo_ids: Vec<MemoId>,
        at_ms: u64,
    },

    /// Peering deltas were sent
    PeeringSent {
        from: SlabId,
        to: SlabId,
        deltas: PeeringDeltas,
        at_ms: u64,
    },
}

impl MeshEvent {
    pub fn memo_id(&self) -> Option<&MemoId> {
        match self {
            MeshEvent::MemoEmitted { memo_id, .. }
            | MeshEvent::MemoDelivered { memo_id, .. }
            | MeshEvent::MemoDropped { memo_id, .. } => Some(memo_id),
            MeshEvent::MemoRequested { .. } | MeshEvent::PeeringSent { .. } => None,
        }
    }

    /// Event time in milliseconds since mesh creation.
    pub fn at_ms(&self) -> u64 {
        match self {
            MeshEvent::MemoEmitted { emit_ms, .. } => *emit_ms,
            MeshEvent::MemoDelivered { delivered_ms, .. } => *delivered_ms,
            MeshEvent::MemoDropped { at_ms, .. }
            | MeshEvent::MemoRequested { at_ms, .. }
            | MeshEvent::PeeringSent { at_ms, .. } => *at_ms,
        }
    }
}
