//! Slabs: LRU-bounded memo storage with replication-gated eviction.
//!
//! A slab stores memos up to a hard `limit`, evicting towards a soft
//! `quota` when it reaches that limit. A memo leaves a slab only after the
//! slab believes enough other slabs hold a copy; otherwise it stays, even
//! past the limit.
//!
//! Per memo:
//!
//! ```text
//! ABSENT --put--> LOCAL --evict_memo--> EVICTING --replicated--> ABSENT
//!                   ^                       |
//!                   +------ unreachable ----+
//! ```
//!
//! A memo missing locally, whether an evicted ancestor a field resolution
//! walks into or a memo a reader has already seen elsewhere, is requested
//! from the slabs the peering ledger lists as holders. Parents count as
//! dependencies there, so a slab keeps track of who holds the ancestors of
//! what it stores.
//!
//! Record state is materialized on demand and stays resident only while a
//! [`Record`] view holds a [`ResidentLease`] on it.
//!
//! All mutable state sits behind one mutex. Nothing here takes a second
//! slab's lock: cross-slab reads go through the atomics exposed by
//! [`SlabHandle`], and completions of pushes to other slabs arrive from mesh
//! delivery after the destination has released its own lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use crate::config::SlabConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::id::{MemoId, RecordId, SlabId};
use crate::lock;
use crate::lru::LruIndex;
use crate::memo::Memo;
use crate::mesh::{Mesh, SlabHandle};
use crate::peering::{
    PeerState, Peerable, PeeringChanges, PeeringDeltas, PeeringLedger, Peerings,
};
use crate::record::{Record, RecordState, Resolution};
use crate::replication::{DropReason, PushJoin, PushOutcome, ReplicationReport};
use crate::value::{validate_payload, Payload};
use crate::wire::MemoPacket;

/// What to do once a replication round settles.
enum Settle {
    /// Log if still short of replicas
    Log,
    /// Finish an eviction attempt
    Evict,
    /// Hand the verdict to a caller
    Notify(Box<dyn FnOnce(bool) + Send>),
}

/// Keeps a record's state resident on its slab. The state is dropped with
/// the last lease.
pub(crate) struct ResidentLease {
    slab: Weak<SlabInner>,
    record: RecordId,
}

impl ResidentLease {
    fn new(slab: &Weak<SlabInner>, record: &RecordId) -> Arc<Self> {
        Arc::new(Self {
            slab: slab.clone(),
            record: record.clone(),
        })
    }
}

impl Drop for ResidentLease {
    fn drop(&mut self) {
        if let Some(slab) = self.slab.upgrade() {
            slab.close_record(&self.record);
        }
    }
}

impl fmt::Debug for ResidentLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResidentLease").field(&self.record).finish()
    }
}

struct Resident {
    state: RecordState,
    lease: Weak<ResidentLease>,
}

struct SlabState {
    id: SlabId,
    mesh: Mesh,
    counter: u64,
    idmap: HashMap<MemoId, Arc<Memo>>,
    lru: LruIndex,
    memos_by_record: HashMap<RecordId, BTreeSet<MemoId>>,
    records: HashMap<RecordId, Resident>,
    peering: PeeringLedger,
}

impl SlabState {
    fn next_seq(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn materialize(&self, record: &RecordId) -> Option<RecordState> {
        let ids = self.memos_by_record.get(record)?;
        Some(RecordState::from_memos(
            ids.iter().filter_map(|id| self.idmap.get(id).cloned()),
        ))
    }

    /// A lease on the record's resident state, materializing it if needed.
    fn open(&mut self, record: &RecordId, slab: &Weak<SlabInner>) -> Option<Arc<ResidentLease>> {
        if let Some(resident) = self.records.get_mut(record) {
            if let Some(lease) = resident.lease.upgrade() {
                return Some(lease);
            }
            let lease = ResidentLease::new(slab, record);
            resident.lease = Arc::downgrade(&lease);
            return Some(lease);
        }
        let state = self.materialize(record)?;
        let lease = ResidentLease::new(slab, record);
        self.records.insert(
            record.clone(),
            Resident {
                state,
                lease: Arc::downgrade(&lease),
            },
        );
        Some(lease)
    }

    /// Run `f` against the resident state, or against a transient one built
    /// from held memos when nothing keeps the record open.
    fn with_record<T>(
        &mut self,
        record: &RecordId,
        f: impl FnOnce(&mut RecordState) -> T,
    ) -> Option<T> {
        if let Some(resident) = self.records.get_mut(record) {
            return Some(f(&mut resident.state));
        }
        let mut state = self.materialize(record)?;
        Some(f(&mut state))
    }

    /// Further copies `id` wants, or `None` if not stored here.
    fn missing_replicas(&self, id: &MemoId) -> Option<usize> {
        let memo = self.idmap.get(id)?;
        let known = self.peering.known_replicas(id);
        Some(memo.desired_replicas(known, self.lru.is_evicting(id)))
    }
}

impl Peerable for SlabState {
    fn ledger(&self) -> &PeeringLedger {
        &self.peering
    }

    fn ledger_mut(&mut self) -> &mut PeeringLedger {
        &mut self.peering
    }

    fn send_peering_changes(&self, changes: PeeringChanges) {
        self.mesh.send_peering_changes(&self.id, changes);
    }
}

pub struct SlabInner {
    id: SlabId,
    config: SlabConfig,
    mesh: Mesh,
    size: AtomicUsize,
    arrivals: Notify,
    state: Mutex<SlabState>,
    this: Weak<SlabInner>,
}

/// A storage node. Cheap to clone; clones share the same slab.
#[derive(Clone)]
pub struct Slab {
    inner: Arc<SlabInner>,
}

impl Deref for Slab {
    type Target = SlabInner;

    fn deref(&self) -> &SlabInner {
        &self.inner
    }
}

impl Slab {
    /// Create a slab and register it with `mesh`.
    pub fn new(mesh: &Mesh, config: SlabConfig) -> Result<Self> {
        config.validate()?;
        let id = config.id.clone();
        let inner = Arc::new_cyclic(|this| SlabInner {
            id: id.clone(),
            mesh: mesh.clone(),
            size: AtomicUsize::new(0),
            arrivals: Notify::new(),
            state: Mutex::new(SlabState {
                id: id.clone(),
                mesh: mesh.clone(),
                counter: 0,
                idmap: HashMap::new(),
                lru: LruIndex::new(),
                memos_by_record: HashMap::new(),
                records: HashMap::new(),
                peering: PeeringLedger::new(id.clone()),
            }),
            this: this.clone(),
            config,
        });

        let handle: Arc<dyn SlabHandle> = inner.clone();
        mesh.register_slab(&handle)?;
        info!(
            slab = %id,
            quota = inner.config.quota,
            limit = inner.config.limit,
            replica_target = inner.config.replica_target,
            "Slab created"
        );
        Ok(Self { inner })
    }

    /// Create a slab with default settings under a mesh-allocated id.
    pub fn with_defaults(mesh: &Mesh) -> Result<Self> {
        Self::new(mesh, SlabConfig::new(mesh.allocate_slab_id()))
    }

    /// This slab as the mesh sees it.
    pub fn handle(&self) -> Arc<dyn SlabHandle> {
        self.inner.clone()
    }

    /// A new reading session on this slab.
    pub fn create_context(&self) -> Context {
        Context::new(self.clone(), self.config.read_policy)
    }

    /// The record through a fresh context, if any memo of it is here.
    pub fn get_record(&self, id: &RecordId) -> Option<Record> {
        self.create_context().get_record(id)
    }
}

impl SlabInner {
    pub fn id(&self) -> &SlabId {
        &self.id
    }

    pub fn config(&self) -> &SlabConfig {
        &self.config
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    /// Memos currently stored.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn quota_remaining(&self) -> usize {
        self.config.quota.saturating_sub(self.size())
    }

    pub fn limit_remaining(&self) -> usize {
        self.config.limit.saturating_sub(self.size())
    }

    /// Notified whenever a memo is stored.
    pub fn arrivals(&self) -> &Notify {
        &self.arrivals
    }

    /// Store a memo minted elsewhere, with no peering knowledge attached.
    pub fn put(&self, memo: Memo) -> Result<()> {
        let mut state = self.lock_state();
        self.put_locked(&mut state, memo, Peerings::new()).map(|_| ())
    }

    /// Fetch a memo, marking it recently used.
    pub fn get(&self, id: &MemoId) -> Option<Arc<Memo>> {
        let mut state = self.lock_state();
        let memo = state.idmap.get(id).cloned()?;
        state.lru.touch(id);
        Some(memo)
    }

    pub fn contains(&self, id: &MemoId) -> bool {
        self.lock_state().idmap.contains_key(id)
    }

    /// Try to bring the slab down to its quota, least recently used first.
    pub fn evict_memos(&self) {
        let mut state = self.lock_state();
        self.evict_locked(&mut state);
    }

    /// Evict one memo once enough other slabs hold it.
    ///
    /// Returns once the attempt has started; the memo may stay if the
    /// replication check cannot be satisfied.
    pub fn evict_memo(&self, id: &MemoId) -> Result<()> {
        let mut state = self.lock_state();
        self.evict_memo_locked(&mut state, id)
    }

    /// Remove a memo unconditionally.
    pub fn kill(&self, id: &MemoId) -> Result<()> {
        let mut state = self.lock_state();
        self.kill_locked(&mut state, id)
    }

    /// Push `id` towards its replica target and report whether the target
    /// was met once every push settled.
    pub fn check_replication_factor(
        &self,
        id: &MemoId,
        callback: impl FnOnce(bool) + Send + 'static,
    ) -> Result<()> {
        let mut state = self.lock_state();
        match self.replication_targets(&state, id)? {
            None => {
                drop(state);
                callback(true);
            }
            Some((_, missing, targets)) if targets.is_empty() => {
                warn!(slab = %self.id, memo = %id, missing, "No slab can accept a replica");
                drop(state);
                callback(false);
            }
            Some((memo, _, targets)) => {
                let settle = Settle::Notify(Box::new(callback));
                self.push_replicas(&mut state, &memo, targets, settle);
            }
        }
        Ok(())
    }

    /// Stored memo ids, most recently used first.
    pub fn dump_memo_ids(&self) -> Vec<MemoId> {
        self.lock_state().lru.iter_recent().cloned().collect()
    }

    pub fn has_memos_for_record(&self, record: &RecordId) -> bool {
        let state = self.lock_state();
        state.memos_by_record.contains_key(record)
            || state.records.get(record).is_some_and(|r| !r.state.is_empty())
    }

    pub fn head_memo_ids_for_record(&self, record: &RecordId) -> BTreeSet<MemoId> {
        self.lock_state()
            .with_record(record, |r| r.head_ids())
            .unwrap_or_default()
    }

    pub fn memo_ids_for_record(&self, record: &RecordId) -> BTreeSet<MemoId> {
        self.lock_state()
            .with_record(record, |r| r.memo_ids())
            .unwrap_or_default()
    }

    /// Remotes known for `id` (optionally only holders).
    pub fn get_peers(&self, id: &MemoId, holding_only: bool) -> Option<Vec<SlabId>> {
        self.lock_state().get_peers(id, holding_only)
    }

    /// Peer states for everything `memo` depends on.
    pub fn get_peerings_for_memo(&self, memo: &MemoId, include_self: bool) -> Peerings {
        self.lock_state().get_peerings_for_memo(memo, include_self)
    }

    /// What this slab believes `remote`'s state for `id` is.
    pub fn peer_state(&self, id: &MemoId, remote: &SlabId) -> PeerState {
        if *remote == self.id {
            return self.lock_state().peering.own_state(id);
        }
        self.lock_state().peering.remote_state(id, remote)
    }

    /// Slabs this slab believes hold `id`, itself included.
    pub fn known_replicas(&self, id: &MemoId) -> usize {
        self.lock_state().peering.known_replicas(id)
    }

    pub fn is_evicting(&self, id: &MemoId) -> bool {
        self.lock_state().lru.is_evicting(id)
    }

    /// Start a record. The returned lease keeps its state resident.
    pub(crate) fn create_record(
        &self,
        payload: Payload,
    ) -> Result<(Arc<Memo>, Arc<ResidentLease>)> {
        validate_payload(&payload)?;
        let mut state = self.lock_state();
        let record_id = RecordId::new(self.id.clone(), state.next_seq());
        let memo_id = MemoId::new(self.id.clone(), state.next_seq());
        let lease = ResidentLease::new(&self.this, &record_id);
        state.records.insert(
            record_id.clone(),
            Resident {
                state: RecordState::default(),
                lease: Arc::downgrade(&lease),
            },
        );
        debug!(slab = %self.id, record = %record_id, "Record created");

        let replicas = self.config.replica_target;
        let memo = Memo::new(memo_id, record_id, BTreeSet::new(), payload, replicas);
        let stored = self.put_locked(&mut state, memo, Peerings::new());
        // A lease must never be dropped under the state lock.
        drop(state);
        Ok((stored?, lease))
    }

    pub(crate) fn append_to_record(
        &self,
        record: &RecordId,
        payload: Payload,
    ) -> Result<Arc<Memo>> {
        validate_payload(&payload)?;
        let mut state = self.lock_state();
        let parents = state
            .with_record(record, |r| r.head_ids())
            .ok_or_else(|| Error::UnknownRecord(record.clone()))?;
        let memo_id = MemoId::new(self.id.clone(), state.next_seq());
        let replicas = self.config.replica_target;
        let memo = Memo::new(memo_id, record.clone(), parents, payload, replicas);
        self.put_locked(&mut state, memo, Peerings::new())
    }

    pub(crate) fn open_record(&self, record: &RecordId) -> Option<Arc<ResidentLease>> {
        self.lock_state().open(record, &self.this)
    }

    /// Drop a record's resident state unless a live lease still holds it.
    fn close_record(&self, record: &RecordId) {
        let mut state = self.lock_state();
        if state
            .records
            .get(record)
            .is_some_and(|r| r.lease.strong_count() == 0)
        {
            state.records.remove(record);
            trace!(slab = %self.id, %record, "Record state released");
        }
    }

    /// Resolve a field and return the heads it was resolved against.
    /// Gaps in the resolution are requested from their holders.
    pub(crate) fn read_field(
        &self,
        record: &RecordId,
        field: &str,
    ) -> Option<(Resolution, Vec<Arc<Memo>>)> {
        let mut state = self.lock_state();
        let (resolution, heads) = state.with_record(record, |r| (r.resolve(field), r.heads()))?;
        for head in &heads {
            state.lru.touch(head.id());
        }
        if !resolution.is_complete() {
            let gaps: Vec<MemoId> = resolution.gaps.iter().cloned().collect();
            self.fetch_locked(&state, &gaps);
        }
        Some((resolution, heads))
    }

    /// Ids in `required` this slab neither holds nor has seen superseded.
    pub(crate) fn uncovered(&self, record: &RecordId, required: &[MemoId]) -> Vec<MemoId> {
        let mut state = self.lock_state();
        let missing: Vec<MemoId> = required
            .iter()
            .filter(|id| !state.idmap.contains_key(*id))
            .cloned()
            .collect();
        if missing.is_empty() {
            return missing;
        }
        state
            .with_record(record, |r| missing.iter().filter(|id| !r.covers(id)).cloned().collect())
            .unwrap_or(missing)
    }

    /// Ask the slabs known to hold each id for a copy.
    pub(crate) fn fetch(&self, ids: &[MemoId]) {
        let state = self.lock_state();
        self.fetch_locked(&state, ids);
    }

    fn lock_state(&self) -> MutexGuard<'_, SlabState> {
        lock(&self.state)
    }

    fn put_locked(
        &self,
        state: &mut SlabState,
        memo: Memo,
        hints: Peerings,
    ) -> Result<Arc<Memo>> {
        let id = memo.id().clone();
        if state.idmap.contains_key(&id) {
            return Err(Error::DuplicateMemo(id));
        }
        memo.validate()?;
        if self.size() >= self.config.limit {
            let (size, limit) = (self.size(), self.config.limit);
            debug!(slab = %self.id, size, limit, "At limit, evicting before put");
            self.evict_locked(state);
        }

        let memo = Arc::new(memo);
        let record = memo.record_id().clone();
        state.idmap.insert(id.clone(), Arc::clone(&memo));
        state.lru.push(id.clone());
        state
            .memos_by_record
            .entry(record.clone())
            .or_default()
            .insert(id.clone());
        if let Some(resident) = state.records.get_mut(&record) {
            resident.state.add_memo(Arc::clone(&memo));
        }
        let size = self.size.fetch_add(1, Ordering::AcqRel) + 1;
        if size > self.config.limit {
            let limit = self.config.limit;
            warn!(slab = %self.id, size, limit, "Over limit, nothing could be evicted");
        }

        let mut peerings = hints;
        for dependency in memo.dependencies() {
            peerings.entry(dependency.clone()).or_default();
        }
        peerings
            .entry(id.clone())
            .or_default()
            .insert(self.id.clone(), PeerState::Holding);
        state.update_peerings(&id, &peerings, false);

        debug!(slab = %self.id, memo = %id, %record, size, "Memo stored");
        self.arrivals.notify_waiters();

        match self.replication_targets(state, &id)? {
            None => {}
            Some((_, missing, targets)) if targets.is_empty() => {
                debug!(slab = %self.id, memo = %id, missing, "No slab can accept a replica yet");
            }
            Some((memo, _, targets)) => self.push_replicas(state, &memo, targets, Settle::Log),
        }
        Ok(memo)
    }

    fn evict_locked(&self, state: &mut SlabState) {
        let excess = self.size().saturating_sub(self.config.quota);
        if excess == 0 {
            return;
        }
        let candidates: Vec<MemoId> = state
            .lru
            .iter()
            .filter(|id| !state.lru.is_evicting(id))
            .take(excess)
            .cloned()
            .collect();
        trace!(slab = %self.id, excess, candidates = candidates.len(), "Evicting");
        for id in candidates {
            if let Err(e) = self.evict_memo_locked(state, &id) {
                warn!(slab = %self.id, memo = %id, error = %e, "Eviction failed");
            }
        }
    }

    fn evict_memo_locked(&self, state: &mut SlabState, id: &MemoId) -> Result<()> {
        match state.lru.set_evicting(id, true) {
            None => {
                warn!(slab = %self.id, memo = %id, "Cannot evict a memo that is not stored");
                return Err(Error::InvalidMemo(id.clone()));
            }
            Some(true) => return Ok(()),
            Some(false) => {}
        }

        match self.replication_targets(state, id)? {
            None => self.kill_locked(state, id),
            Some((_, missing, targets)) if targets.is_empty() => {
                state.lru.set_evicting(id, false);
                debug!(
                    slab = %self.id, memo = %id, missing,
                    "Eviction deferred, no slab can take a replica"
                );
                Ok(())
            }
            Some((memo, _, targets)) => {
                self.push_replicas(state, &memo, targets, Settle::Evict);
                Ok(())
            }
        }
    }

    fn kill_locked(&self, state: &mut SlabState, id: &MemoId) -> Result<()> {
        let Some(memo) = state.idmap.remove(id) else {
            warn!(slab = %self.id, memo = %id, "Cannot kill a memo that is not stored");
            return Err(Error::InvalidMemo(id.clone()));
        };
        state.lru.remove(id);

        let record = memo.record_id();
        if let Some(ids) = state.memos_by_record.get_mut(record) {
            ids.remove(id);
            if ids.is_empty() {
                state.memos_by_record.remove(record);
            }
        }
        if let Some(resident) = state.records.get_mut(record) {
            if !resident.state.release(id) {
                trace!(slab = %self.id, memo = %id, "Record keeps its head memo");
            }
        }
        let size = self.size.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);

        state.deregister_peering_for_memo(id);
        debug!(slab = %self.id, memo = %id, size, "Memo removed");
        Ok(())
    }

    fn fetch_locked(&self, state: &SlabState, ids: &[MemoId]) {
        let mut by_holder: BTreeMap<SlabId, Vec<MemoId>> = BTreeMap::new();
        for id in ids {
            if state.idmap.contains_key(id) {
                continue;
            }
            // With no holder on record, the origin slab is the best guess.
            let holders = match state.peering.peers(id, true) {
                Some(holders) if !holders.is_empty() => holders,
                _ => vec![id.slab().clone()],
            };
            for holder in holders {
                if holder != self.id {
                    by_holder.entry(holder).or_default().push(id.clone());
                }
            }
        }
        for (holder, ids) in by_holder {
            debug!(slab = %self.id, %holder, ?ids, "Requesting missing memos");
            self.mesh.request_memos(&self.id, &holder, ids);
        }
    }

    /// `None` when `id` has all the replicas it wants. Otherwise the memo,
    /// how many copies are missing and the slabs that could take one.
    #[allow(clippy::type_complexity)]
    fn replication_targets(
        &self,
        state: &SlabState,
        id: &MemoId,
    ) -> Result<Option<(Arc<Memo>, usize, Vec<Arc<dyn SlabHandle>>)>> {
        let memo = state
            .idmap
            .get(id)
            .cloned()
            .ok_or_else(|| Error::InvalidMemo(id.clone()))?;
        let missing = state.missing_replicas(id).unwrap_or(0);
        if missing == 0 {
            return Ok(None);
        }

        let mut exclude = state.peering.peers(id, true).unwrap_or_default();
        exclude.push(self.id.clone());
        let targets = self.mesh.get_accepting_slabs(&exclude, missing);
        Ok(Some((memo, missing, targets)))
    }

    fn push_replicas(
        &self,
        state: &mut SlabState,
        memo: &Arc<Memo>,
        targets: Vec<Arc<dyn SlabHandle>>,
        settle: Settle,
    ) {
        let id = memo.id().clone();
        let mut peerings = state.get_peerings_for_memo(&id, true);
        {
            let remotes = peerings.entry(id.clone()).or_default();
            for target in &targets {
                remotes
                    .entry(target.id().clone())
                    .or_insert(PeerState::Aware);
            }
        }

        let this = self.this.clone();
        let join = PushJoin::new(id.clone(), move |report| {
            if let Some(slab) = this.upgrade() {
                slab.replication_settled(report, settle);
            }
        });

        debug!(slab = %self.id, memo = %id, targets = targets.len(), "Pushing replicas");
        for target in targets {
            let to = target.id().clone();
            let ticket = join.ticket(to.clone());
            let this = self.this.clone();
            let memo_id = id.clone();
            let destination = to.clone();
            let peerings = peerings.clone();
            self.mesh.push_memo_to_slab(&self.id, &to, memo, peerings, move |outcome| {
                if let Some(slab) = this.upgrade() {
                    slab.push_settled(&memo_id, &destination, outcome);
                }
                ticket.settle(outcome);
            });
        }
        join.seal();
    }

    fn push_settled(&self, id: &MemoId, to: &SlabId, outcome: PushOutcome) {
        if !outcome.is_success() {
            return;
        }
        let mut state = self.lock_state();
        if state.idmap.contains_key(id) {
            // The destination announces itself; no need to echo.
            state.register_peering(id, id, to, PeerState::Holding, true);
        }
    }

    fn replication_settled(&self, report: ReplicationReport, settle: Settle) {
        let mut state = self.lock_state();
        let id = &report.memo;
        for (to, reason) in report.failed() {
            if reason != DropReason::Abandoned {
                let err = Error::DeliveryDropped {
                    memo: id.clone(),
                    slab: to.clone(),
                };
                debug!(slab = %self.id, error = %err, %reason, "Replica push failed");
            }
        }
        let missing = state.missing_replicas(id);

        match settle {
            Settle::Log => {
                if let Some(missing) = missing.filter(|&m| m > 0) {
                    let err = Error::UnderReplicated {
                        memo: id.clone(),
                        missing,
                    };
                    warn!(slab = %self.id, error = %err, "Replication incomplete");
                }
            }
            Settle::Evict => match missing {
                None => {}
                Some(0) => {
                    if let Err(e) = self.kill_locked(&mut state, id) {
                        warn!(slab = %self.id, memo = %id, error = %e, "Eviction failed");
                    }
                }
                Some(missing) => {
                    state.lru.set_evicting(id, false);
                    let err = Error::UnderReplicated {
                        memo: id.clone(),
                        missing,
                    };
                    warn!(slab = %self.id, error = %err, "Eviction abandoned");
                }
            },
            Settle::Notify(callback) => {
                drop(state);
                callback(missing == Some(0));
            }
        }
    }
}

impl SlabHandle for SlabInner {
    fn id(&self) -> &SlabId {
        &self.id
    }

    fn quota_remaining(&self) -> usize {
        SlabInner::quota_remaining(self)
    }

    fn limit_remaining(&self) -> usize {
        SlabInner::limit_remaining(self)
    }

    fn receive_memo(&self, from: &SlabId, packet: MemoPacket) -> PushOutcome {
        let (memo, peerings) = packet.into_memo();
        let id = memo.id().clone();
        let mut state = self.lock_state();

        if state.idmap.contains_key(&id) {
            state.update_peerings(&id, &peerings, false);
            trace!(slab = %self.id, %from, memo = %id, "Already holding pushed memo");
            return PushOutcome::AlreadyHeld;
        }
        if SlabInner::limit_remaining(self) == 0 {
            return PushOutcome::Dropped(DropReason::AtCapacity);
        }

        match self.put_locked(&mut state, memo, peerings) {
            Ok(_) => PushOutcome::Delivered,
            Err(e) => {
                warn!(slab = %self.id, %from, memo = %id, error = %e, "Rejected pushed memo");
                PushOutcome::Dropped(DropReason::Rejected)
            }
        }
    }

    fn receive_peering_change(&self, from: &SlabId, deltas: &PeeringDeltas) {
        trace!(slab = %self.id, %from, ?deltas, "Peering change received");
        Peerable::receive_peering_change(&mut *self.lock_state(), from, deltas);
    }

    fn receive_memo_request(&self, from: &SlabId, ids: &[MemoId]) {
        if *from == self.id {
            return;
        }
        let mut state = self.lock_state();
        let mut not_held = PeeringDeltas::new();
        for id in ids {
            let Some(memo) = state.idmap.get(id).cloned() else {
                not_held.insert(id.clone(), state.peering.own_state(id));
                continue;
            };
            state.lru.touch(id);
            let peerings = state.get_peerings_for_memo(id, true);
            self.mesh.send_requested_memo(&self.id, from, &memo, peerings);
        }
        if !not_held.is_empty() {
            trace!(slab = %self.id, %from, ?not_held, "Requested memos not held");
            // Corrects the requester's belief that we hold them.
            state.send_peering_changes(PeeringChanges::from([(from.clone(), not_held)]));
        }
    }

    fn receive_requested_memo(&self, from: &SlabId, packet: MemoPacket) {
        let (memo, peerings) = packet.into_memo();
        let id = memo.id().clone();
        let mut state = self.lock_state();

        if state.idmap.contains_key(&id) {
            state.update_peerings(&id, &peerings, false);
            trace!(slab = %self.id, %from, memo = %id, "Requested memo already held");
            return;
        }
        match self.put_locked(&mut state, memo, peerings) {
            Ok(_) => debug!(slab = %self.id, %from, memo = %id, "Requested memo stored"),
            Err(e) => {
                warn!(slab = %self.id, %from, memo = %id, error = %e, "Rejected requested memo");
            }
        }
    }
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("id", &self.id)
            .field("size", &self.size())
            .field("quota", &self.config.quota)
            .field("limit", &self.config.limit)
            .finish()
    }
}
