//! Strata Store - Causally Consistent Replicated Memos
//!
//! An in-process model of a replicated store where every write is an
//! immutable *memo* and logical documents (*records*) are materialized from
//! the memo DAG on read.
//!
//! # Architecture
//!
//! - **Slab**: LRU-bounded memo storage that evicts only after a memo is
//!   known to be held elsewhere
//! - **Peering**: per-memo gossip of which slabs are aware of or hold a copy
//! - **Mesh**: simulated network with latency, or manual flushing when
//!   disconnected
//! - **Context / Record**: causal reading sessions and field resolution
//!
//! # Example
//!
//! ```no_run
//! use strata_store::{payload, Mesh, MeshConfig, Record, Slab, SlabConfig, SlabId};
//!
//! fn main() -> strata_store::Result<()> {
//!     let mesh = Mesh::new(MeshConfig::disconnected())?;
//!     let a = Slab::new(&mesh, SlabConfig::new(SlabId::new("A")?))?;
//!     let b = Slab::new(&mesh, SlabConfig::new(SlabId::new("B")?))?;
//!
//!     let ctx = a.create_context();
//!     let cow = Record::create(&ctx, payload([("sound", "moo")]))?;
//!     mesh.deliver_all_queued_messages();
//!
//!     let seen = b.get_record(cow.id()).and_then(|r| r.get("sound"));
//!     assert_eq!(seen.as_ref().and_then(|v| v.as_str()), Some("moo"));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod id;
pub mod mesh;
pub mod peering;
pub mod replication;
pub mod slab;
pub mod value;
pub mod wire;

mod lru;
mod memo;
mod record;

pub use config::{MeshConfig, ReadPolicy, SlabConfig};
pub use context::{CausalFrontier, CausalRef, Context};
pub use error::{Error, Result};
pub use id::{EntityId, MemoId, RecordId, SlabId};
pub use memo::Memo;
pub use mesh::{LatencyModel, Mesh, MeshEvent, SlabHandle};
pub use peering::{PeerState, Peerings};
pub use record::Record;
pub use replication::{DropReason, PushOutcome, ReplicationReport};
pub use slab::Slab;
pub use value::{payload, validate_payload, Payload, Value, REF_KEY_PREFIX};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// A panic while holding one of these locks leaves plain bookkeeping behind,
// so poisoning is ignored.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
