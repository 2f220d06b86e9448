//! Records: logical documents materialized from memo DAGs.
//!
//! A record is never stored or transmitted. Each slab builds a
//! [`RecordState`] from the memos it holds and resolves fields by walking
//! from the heads towards the root. [`Record`] is the reader-facing view: a
//! record id bound to a [`Context`]. The slab keeps a record's state
//! resident only while some view of it is alive.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::ReadPolicy;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::{MemoId, RecordId};
use crate::memo::Memo;
use crate::slab::ResidentLease;
use crate::value::{Payload, Value};

/// A field resolved against one slab's memos.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Resolution {
    pub value: Option<Value>,
    /// Ancestors the walk needed but the slab does not hold
    pub gaps: BTreeSet<MemoId>,
}

impl Resolution {
    /// Whether `value` is the answer the full DAG would give.
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Memos of one record held by one slab.
#[derive(Debug, Default)]
pub(crate) struct RecordState {
    memos_by_id: BTreeMap<MemoId, Arc<Memo>>,
    /// parent -> children. Kept after memos are released: a memo once seen
    /// as a parent stays superseded.
    memos_by_parent: HashMap<MemoId, BTreeSet<MemoId>>,
}

impl RecordState {
    pub(crate) fn from_memos(memos: impl IntoIterator<Item = Arc<Memo>>) -> Self {
        let mut state = Self::default();
        for memo in memos {
            state.add_memo(memo);
        }
        state
    }

    pub(crate) fn add_memo(&mut self, memo: Arc<Memo>) {
        for parent in memo.parents() {
            self.memos_by_parent
                .entry(parent.clone())
                .or_default()
                .insert(memo.id().clone());
        }
        self.memos_by_id.insert(memo.id().clone(), memo);
    }

    /// Forget a memo unless it is a head. Returns whether it was released.
    pub(crate) fn release(&mut self, id: &MemoId) -> bool {
        if self.is_head(id) {
            return false;
        }
        self.memos_by_id.remove(id).is_some()
    }

    pub(crate) fn is_head(&self, id: &MemoId) -> bool {
        self.memos_by_id.contains_key(id) && !self.memos_by_parent.contains_key(id)
    }

    /// Held memos not superseded by any known child, ascending.
    pub(crate) fn heads(&self) -> Vec<Arc<Memo>> {
        self.memos_by_id
            .iter()
            .filter(|(id, _)| !self.memos_by_parent.contains_key(*id))
            .map(|(_, memo)| Arc::clone(memo))
            .collect()
    }

    pub(crate) fn head_ids(&self) -> BTreeSet<MemoId> {
        self.heads().iter().map(|m| m.id().clone()).collect()
    }

    pub(crate) fn memo_ids(&self) -> BTreeSet<MemoId> {
        self.memos_by_id.keys().cloned().collect()
    }

    /// Whether this state accounts for `id`: held, or named as the parent
    /// of a memo seen here.
    pub(crate) fn covers(&self, id: &MemoId) -> bool {
        self.memos_by_id.contains_key(id) || self.memos_by_parent.contains_key(id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.memos_by_id.is_empty()
    }

    /// Resolve a field. The first head (by id) defining it wins; failing
    /// that, the search moves one generation back at a time.
    ///
    /// A parent that is not held leaves a gap. Any gap met before the value
    /// is found makes the result incomplete, since the missing memo could
    /// have defined the field first.
    pub(crate) fn resolve(&self, field: &str) -> Resolution {
        let mut visited: HashSet<&MemoId> = HashSet::new();
        let mut gaps = BTreeSet::new();
        let mut frontier: Vec<&Memo> = self
            .memos_by_id
            .iter()
            .filter(|(id, _)| !self.memos_by_parent.contains_key(*id))
            .map(|(_, memo)| &**memo)
            .collect();

        while !frontier.is_empty() {
            frontier.sort_by(|a, b| a.id().cmp(b.id()));
            if let Some(value) = frontier.iter().find_map(|m| m.get(field)) {
                return Resolution {
                    value: Some(value.clone()),
                    gaps,
                };
            }

            let mut next = Vec::new();
            for memo in &frontier {
                for parent in memo.parents() {
                    if !visited.insert(parent) {
                        continue;
                    }
                    match self.memos_by_id.get(parent) {
                        Some(p) => next.push(&**p),
                        None => {
                            gaps.insert(parent.clone());
                        }
                    }
                }
            }
            frontier = next;
        }
        Resolution { value: None, gaps }
    }
}

/// A record as seen through a context.
#[derive(Clone)]
pub struct Record {
    id: RecordId,
    context: Context,
    _lease: Arc<ResidentLease>,
}

impl Record {
    /// Start a new record on the context's slab with `payload` as its
    /// first memo.
    pub fn create(context: &Context, payload: Payload) -> Result<Self> {
        let (memo, lease) = context.slab().create_record(payload)?;
        context.add_memos([&*memo]);
        Ok(Self::attach(memo.record_id().clone(), context.clone(), lease))
    }

    pub(crate) fn attach(id: RecordId, context: Context, lease: Arc<ResidentLease>) -> Self {
        Self {
            id,
            context,
            _lease: lease,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Append a memo whose parents are the current heads.
    pub fn set(&self, payload: Payload) -> Result<MemoId> {
        let memo = self.context.slab().append_to_record(&self.id, payload)?;
        self.context.add_memos([&*memo]);
        Ok(memo.id().clone())
    }

    /// Resolve `field` from what the slab holds now.
    ///
    /// If an ancestor the walk needed was evicted, this is the best answer
    /// available locally and the slab asks a holder for the missing memo.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.read(field)?.value
    }

    /// Like [`get`](Self::get), but only once the slab holds everything this
    /// context has already observed of the record, along with every
    /// ancestor the resolution of `field` walks through.
    ///
    /// Missing memos are requested from slabs known to hold them. With
    /// [`ReadPolicy::Immediate`] a stale read yields `Ok(None)`. With
    /// [`ReadPolicy::Blocking`] it waits for arrivals and fails with
    /// [`Error::Stale`] when the timeout passes.
    pub async fn get_fresh_or_null(&self, field: &str) -> Result<Option<Value>> {
        match self.context.read_policy() {
            ReadPolicy::Immediate => Ok(self.read_fresh(field).flatten()),
            ReadPolicy::Blocking { timeout } => self.wait_fresh(field, timeout).await,
        }
    }

    /// Whether the slab holds every memo of this record in the context's
    /// frontier, or has seen a descendant of it.
    ///
    /// This is the causal half of a fresh read. Evicted ancestors are only
    /// noticed once a field resolution walks into them.
    pub fn is_fresh(&self) -> bool {
        self.missing_prerequisites().is_empty()
    }

    pub fn head_memo_ids(&self) -> BTreeSet<MemoId> {
        self.context.slab().head_memo_ids_for_record(&self.id)
    }

    pub fn memo_ids(&self) -> BTreeSet<MemoId> {
        self.context.slab().memo_ids_for_record(&self.id)
    }

    fn missing_prerequisites(&self) -> Vec<MemoId> {
        let required = self.context.frontier_for(&self.id);
        self.context.slab().uncovered(&self.id, &required)
    }

    fn read(&self, field: &str) -> Option<Resolution> {
        let (resolution, heads) = self.context.slab().read_field(&self.id, field)?;
        self.context.add_memos(heads.iter().map(|m| &**m));
        Some(resolution)
    }

    /// `None` while the slab cannot give an up-to-date answer.
    fn read_fresh(&self, field: &str) -> Option<Option<Value>> {
        let missing = self.missing_prerequisites();
        if !missing.is_empty() {
            debug!(record = %self.id, field, missing = missing.len(), "Stale read");
            self.context.slab().fetch(&missing);
            return None;
        }
        match self.read(field) {
            None => Some(None),
            Some(resolution) if resolution.is_complete() => Some(resolution.value),
            Some(resolution) => {
                debug!(record = %self.id, field, gaps = ?resolution.gaps, "Resolution incomplete");
                None
            }
        }
    }

    async fn wait_fresh(&self, field: &str, timeout: Duration) -> Result<Option<Value>> {
        let deadline = Instant::now() + timeout;
        let slab = self.context.slab();
        loop {
            let arrived = slab.arrivals().notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(value) = self.read_fresh(field) {
                return Ok(value);
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                debug!(record = %self.id, ?timeout, "Gave up waiting for causal prerequisites");
                return Err(Error::Stale {
                    record: self.id.clone(),
                });
            }
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("slab", self.context.slab().id())
            .finish()
    }
}
