//! Causal contexts.
//!
//! A [`Context`] is a reader's session on one slab. It remembers the
//! causally maximal memos the reader has observed (its frontier) so a later
//! read can tell when the slab has not caught up with what the reader
//! already saw elsewhere.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::ReadPolicy;
use crate::id::{MemoId, RecordId};
use crate::lock;
use crate::memo::Memo;
use crate::record::Record;
use crate::slab::Slab;

/// One frontier entry: a memo and the record it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CausalRef {
    pub record_id: RecordId,
    pub memo_id: MemoId,
}

/// How many superseded ids a frontier remembers by default.
pub const DEFAULT_SUPERSEDED_CAPACITY: usize = 4096;

/// The set of causally maximal memos observed so far.
///
/// Ids of superseded memos are remembered so a late ancestor is not
/// re-added. That memory is bounded: once more than its capacity has been
/// superseded, the oldest are forgotten, and an ancestor arriving after
/// that would rejoin the frontier. Such an entry is harmless to freshness
/// checks since any slab holding its descendant covers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CausalFrontier {
    entries: BTreeMap<MemoId, RecordId>,
    superseded: HashSet<MemoId>,
    superseded_order: VecDeque<MemoId>,
    superseded_capacity: usize,
}

impl Default for CausalFrontier {
    fn default() -> Self {
        Self::with_superseded_capacity(DEFAULT_SUPERSEDED_CAPACITY)
    }
}

impl CausalFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_superseded_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            superseded: HashSet::new(),
            superseded_order: VecDeque::new(),
            superseded_capacity: capacity,
        }
    }

    /// Observe a memo: its parents leave the frontier, it joins.
    ///
    /// A memo already known to be superseded by an observed descendant is
    /// not re-added.
    pub fn add_memo(&mut self, memo: &Memo) {
        for parent in memo.parents() {
            self.entries.remove(parent);
            self.supersede(parent);
        }
        if !self.superseded.contains(memo.id()) {
            self.entries
                .insert(memo.id().clone(), memo.record_id().clone());
        }
    }

    fn supersede(&mut self, id: &MemoId) {
        if !self.superseded.insert(id.clone()) {
            return;
        }
        self.superseded_order.push_back(id.clone());
        while self.superseded_order.len() > self.superseded_capacity {
            if let Some(oldest) = self.superseded_order.pop_front() {
                self.superseded.remove(&oldest);
            }
        }
    }

    /// Merge another observer's frontier as is.
    pub fn add_raw(&mut self, refs: impl IntoIterator<Item = CausalRef>) {
        for r in refs {
            self.entries.insert(r.memo_id, r.record_id);
        }
    }

    pub fn memo_ids(&self) -> BTreeSet<MemoId> {
        self.entries.keys().cloned().collect()
    }

    /// Frontier entries belonging to `record`.
    pub fn for_record<'a>(
        &'a self,
        record: &'a RecordId,
    ) -> impl Iterator<Item = &'a MemoId> + 'a {
        self.entries
            .iter()
            .filter(move |(_, r)| *r == record)
            .map(|(m, _)| m)
    }

    pub fn export(&self) -> Vec<CausalRef> {
        self.entries
            .iter()
            .map(|(memo_id, record_id)| CausalRef {
                record_id: record_id.clone(),
                memo_id: memo_id.clone(),
            })
            .collect()
    }

    pub fn contains(&self, id: &MemoId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A reader's session on one slab.
///
/// Clones share the same frontier.
#[derive(Clone)]
pub struct Context {
    slab: Slab,
    frontier: Arc<Mutex<CausalFrontier>>,
    read_policy: ReadPolicy,
}

impl Context {
    pub(crate) fn new(slab: Slab, read_policy: ReadPolicy) -> Self {
        Self {
            slab,
            frontier: Arc::new(Mutex::new(CausalFrontier::new())),
            read_policy,
        }
    }

    pub fn slab(&self) -> &Slab {
        &self.slab
    }

    pub fn read_policy(&self) -> ReadPolicy {
        self.read_policy
    }

    #[must_use]
    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn add_memos<'a>(&self, memos: impl IntoIterator<Item = &'a Memo>) {
        let mut frontier = lock(&self.frontier);
        for memo in memos {
            frontier.add_memo(memo);
        }
    }

    pub fn add_raw_context(&self, refs: impl IntoIterator<Item = CausalRef>) {
        lock(&self.frontier).add_raw(refs);
    }

    /// Causally maximal memo ids observed so far.
    pub fn frontier(&self) -> BTreeSet<MemoId> {
        lock(&self.frontier).memo_ids()
    }

    /// Frontier in a form another context can merge.
    pub fn export(&self) -> Vec<CausalRef> {
        lock(&self.frontier).export()
    }

    pub(crate) fn frontier_for(&self, record: &RecordId) -> Vec<MemoId> {
        lock(&self.frontier).for_record(record).cloned().collect()
    }

    /// The record, if this slab has any memo of it.
    ///
    /// The slab keeps the record's state resident while the returned view
    /// (or a clone of it) is alive.
    pub fn get_record(&self, id: &RecordId) -> Option<Record> {
        let lease = self.slab.open_record(id)?;
        Some(Record::attach(id.clone(), self.clone(), lease))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("slab", self.slab.id())
            .field("frontier", &self.frontier())
            .field("read_policy", &self.read_policy)
            .finish()
    }
}
