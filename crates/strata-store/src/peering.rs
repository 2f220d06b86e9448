//! Peering: who else is aware of, or holds, a memo.
//!
//! Every slab keeps a [`PeeringLedger`]. For each memo it stores the ledger
//! records the ids that memo depends on (itself plus any memo it references)
//! and, per referenced id, what each remote slab has told us about its own
//! relationship to that id.
//!
//! ## Gossip
//!
//! Peering messages only ever carry the sender's *own* state:
//!
//! 1. When our own state for an id changes, tell every remote we know for it.
//! 2. When we learn of a remote we did not know for an id, reply once with
//!    our own state so the remote learns of us too.
//! 3. Packet hints only upgrade what we believe about third parties.
//! 4. A positive state for an id we do not track is answered with `None`,
//!    which retracts the sender's stale belief about us.
//!
//! Replies are only ever sent for previously unknown remotes and `None` is
//! never answered, so every exchange terminates.
//!
//! The ledger is pure bookkeeping: its methods return the outbound
//! [`PeeringChanges`] and leave sending to the [`Peerable`] implementor.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{MemoId, SlabId};

/// A slab's relationship to a memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PeerState {
    /// No relationship
    None = 0,
    /// References the memo without holding a copy
    Aware = 1,
    /// Holds a copy
    Holding = 2,
}

impl From<PeerState> for u8 {
    fn from(state: PeerState) -> Self {
        state as u8
    }
}

impl TryFrom<u8> for PeerState {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            0 => Ok(PeerState::None),
            1 => Ok(PeerState::Aware),
            2 => Ok(PeerState::Holding),
            other => Err(format!("invalid peer state {other}")),
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::None => write!(f, "none"),
            PeerState::Aware => write!(f, "aware"),
            PeerState::Holding => write!(f, "holding"),
        }
    }
}

/// Per-id peer states, as carried by a memo packet.
pub type Peerings = BTreeMap<MemoId, BTreeMap<SlabId, PeerState>>;

/// The sender's own state per memo id, as carried by a peering message.
pub type PeeringDeltas = BTreeMap<MemoId, PeerState>;

/// Outbound deltas grouped by destination slab.
pub type PeeringChanges = BTreeMap<SlabId, PeeringDeltas>;

#[derive(Debug, Default, Clone)]
struct RefPeering {
    /// Local memos depending on this id
    memos: BTreeSet<MemoId>,
    /// What each remote reported about itself
    remotes: BTreeMap<SlabId, PeerState>,
}

/// Peering bookkeeping for one slab.
#[derive(Debug)]
pub struct PeeringLedger {
    local: SlabId,
    local_peerings: HashMap<MemoId, BTreeSet<MemoId>>,
    ref_peerings: HashMap<MemoId, RefPeering>,
    held: HashSet<MemoId>,
}

impl PeeringLedger {
    pub fn new(local: SlabId) -> Self {
        Self {
            local,
            local_peerings: HashMap::new(),
            ref_peerings: HashMap::new(),
            held: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> &SlabId {
        &self.local
    }

    /// Our own state for `id`.
    pub fn own_state(&self, id: &MemoId) -> PeerState {
        if self.held.contains(id) {
            PeerState::Holding
        } else if self.ref_peerings.contains_key(id) {
            PeerState::Aware
        } else {
            PeerState::None
        }
    }

    /// Whether any local memo depends on `id`.
    pub fn tracks(&self, id: &MemoId) -> bool {
        self.ref_peerings.contains_key(id)
    }

    /// Record that local memo `memo` depends on every id in `peerings`,
    /// merging in the supplied peer states.
    ///
    /// An entry for the local slab at `Holding` marks the id as held here.
    pub fn update(&mut self, memo: &MemoId, peerings: &Peerings) -> PeeringChanges {
        let mut changes = PeeringChanges::new();

        for (ref_id, remotes) in peerings {
            self.local_peerings
                .entry(memo.clone())
                .or_default()
                .insert(ref_id.clone());

            let before = self.own_state(ref_id);
            let entry = self.ref_peerings.entry(ref_id.clone()).or_default();
            entry.memos.insert(memo.clone());

            let mut newly_known = Vec::new();
            for (slab, &state) in remotes {
                if *slab == self.local {
                    if state == PeerState::Holding {
                        self.held.insert(ref_id.clone());
                    }
                    continue;
                }
                if state == PeerState::None {
                    continue;
                }
                match entry.remotes.get(slab).copied() {
                    None => {
                        entry.remotes.insert(slab.clone(), state);
                        newly_known.push(slab.clone());
                    }
                    Some(prev) if state > prev => {
                        entry.remotes.insert(slab.clone(), state);
                    }
                    Some(_) => {}
                }
            }

            let own = self.own_state(ref_id);
            let targets: Vec<SlabId> = if own != before {
                self.remotes_of(ref_id).cloned().collect()
            } else {
                newly_known
            };
            for slab in targets {
                changes.entry(slab).or_default().insert(ref_id.clone(), own);
            }
        }

        changes
    }

    /// Apply a peering message from `from`, returning any replies.
    pub fn receive(&mut self, from: &SlabId, deltas: &PeeringDeltas) -> PeeringChanges {
        let mut changes = PeeringChanges::new();
        if *from == self.local {
            return changes;
        }

        for (id, &state) in deltas {
            let own = self.own_state(id);
            let Some(entry) = self.ref_peerings.get_mut(id) else {
                if state != PeerState::None {
                    changes
                        .entry(from.clone())
                        .or_default()
                        .insert(id.clone(), PeerState::None);
                }
                continue;
            };

            let prev = if state == PeerState::None {
                entry.remotes.remove(from)
            } else {
                entry.remotes.insert(from.clone(), state)
            };
            if prev.is_none() && state != PeerState::None {
                changes.entry(from.clone()).or_default().insert(id.clone(), own);
            }
        }

        changes
    }

    /// Drop everything local memo `memo` contributed.
    ///
    /// Ids left with no dependent local memo are forgotten and every remote
    /// that knew of them hears `None`. If `memo` itself is still referenced
    /// by another local memo, remotes hear that we downgraded to `Aware`.
    pub fn deregister(&mut self, memo: &MemoId) -> PeeringChanges {
        let mut changes = PeeringChanges::new();
        self.held.remove(memo);

        let Some(refs) = self.local_peerings.remove(memo) else {
            return changes;
        };

        for ref_id in refs {
            let Some(entry) = self.ref_peerings.get_mut(&ref_id) else {
                continue;
            };
            entry.memos.remove(memo);

            if entry.memos.is_empty() {
                if let Some(entry) = self.ref_peerings.remove(&ref_id) {
                    for slab in entry.remotes.into_keys() {
                        changes
                            .entry(slab)
                            .or_default()
                            .insert(ref_id.clone(), PeerState::None);
                    }
                }
                self.held.remove(&ref_id);
            } else if ref_id == *memo {
                for slab in entry.remotes.keys() {
                    changes
                        .entry(slab.clone())
                        .or_default()
                        .insert(ref_id.clone(), PeerState::Aware);
                }
            }
        }

        changes
    }

    /// Peerings for every id local memo `memo` depends on.
    pub fn peerings_for(&self, memo: &MemoId, include_self: bool) -> Peerings {
        let mut out = Peerings::new();
        let Some(refs) = self.local_peerings.get(memo) else {
            return out;
        };
        for ref_id in refs {
            let mut remotes = self
                .ref_peerings
                .get(ref_id)
                .map(|e| e.remotes.clone())
                .unwrap_or_default();
            if include_self {
                remotes.insert(self.local.clone(), self.own_state(ref_id));
            }
            out.insert(ref_id.clone(), remotes);
        }
        out
    }

    /// Remotes known for `id`, optionally only those holding a copy.
    pub fn peers(&self, id: &MemoId, holding_only: bool) -> Option<Vec<SlabId>> {
        let entry = self.ref_peerings.get(id)?;
        Some(
            entry
                .remotes
                .iter()
                .filter(|(_, state)| !holding_only || **state == PeerState::Holding)
                .map(|(slab, _)| slab.clone())
                .collect(),
        )
    }

    /// What `remote` last told us about `id`.
    pub fn remote_state(&self, id: &MemoId, remote: &SlabId) -> PeerState {
        self.ref_peerings
            .get(id)
            .and_then(|e| e.remotes.get(remote).copied())
            .unwrap_or(PeerState::None)
    }

    /// Slabs known to hold `id`, the local slab included.
    pub fn known_replicas(&self, id: &MemoId) -> usize {
        let remote = self
            .ref_peerings
            .get(id)
            .map(|e| e.remotes.values().filter(|&&s| s == PeerState::Holding).count())
            .unwrap_or(0);
        remote + usize::from(self.held.contains(id))
    }

    fn remotes_of(&self, id: &MemoId) -> impl Iterator<Item = &SlabId> {
        self.ref_peerings
            .get(id)
            .into_iter()
            .flat_map(|e| e.remotes.keys())
    }
}

/// Peering behaviour for anything holding a [`PeeringLedger`].
///
/// Implementors provide ledger access and a way to send changes; the
/// protocol itself lives in the provided methods.
pub trait Peerable {
    fn ledger(&self) -> &PeeringLedger;

    fn ledger_mut(&mut self) -> &mut PeeringLedger;

    /// Hand outbound deltas to the transport.
    fn send_peering_changes(&self, changes: PeeringChanges);

    fn register_peering(
        &mut self,
        memo: &MemoId,
        ref_id: &MemoId,
        remote: &SlabId,
        state: PeerState,
        silent: bool,
    ) {
        let mut peerings = Peerings::new();
        peerings
            .entry(ref_id.clone())
            .or_default()
            .insert(remote.clone(), state);
        self.update_peerings(memo, &peerings, silent);
    }

    fn update_peerings(&mut self, memo: &MemoId, peerings: &Peerings, silent: bool) {
        let changes = self.ledger_mut().update(memo, peerings);
        if !silent && !changes.is_empty() {
            self.send_peering_changes(changes);
        }
    }

    fn receive_peering_change(&mut self, from: &SlabId, deltas: &PeeringDeltas) {
        let changes = self.ledger_mut().receive(from, deltas);
        if !changes.is_empty() {
            self.send_peering_changes(changes);
        }
    }

    fn deregister_peering_for_memo(&mut self, memo: &MemoId) {
        let changes = self.ledger_mut().deregister(memo);
        if !changes.is_empty() {
            self.send_peering_changes(changes);
        }
    }

    fn get_peerings_for_memo(&self, memo: &MemoId, include_self: bool) -> Peerings {
        self.ledger().peerings_for(memo, include_self)
    }

    fn get_peers(&self, id: &MemoId, holding_only: bool) -> Option<Vec<SlabId>> {
        self.ledger().peers(id, holding_only)
    }
}
