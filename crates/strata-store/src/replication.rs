//! Replication fan-out/fan-in.
//!
//! A replication check pushes one memo to several slabs and must wait for
//! all of them before deciding anything. [`PushJoin`] hands out one
//! [`PushTicket`] per destination; once the join is sealed and every ticket
//! is settled, the completion runs with a [`ReplicationReport`].
//!
//! Tickets are only ever settled from mesh delivery, never from inside the
//! push that created them, so a sealed join never completes while its
//! initiator still holds its slab lock.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::id::{MemoId, SlabId};
use crate::lock;

/// Why a push did not land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Destination had no room left
    AtCapacity,
    /// Destination is not (or no longer) registered
    UnknownSlab,
    /// Packet could not be encoded or decoded
    Malformed,
    /// Destination refused the memo
    Rejected,
    /// The push was discarded before it was delivered
    Abandoned,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::AtCapacity => "at capacity",
            DropReason::UnknownSlab => "unknown slab",
            DropReason::Malformed => "malformed packet",
            DropReason::Rejected => "rejected",
            DropReason::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

/// Result of a single push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Destination stored the memo
    Delivered,
    /// Destination already had it
    AlreadyHeld,
    /// Nothing was stored
    Dropped(DropReason),
}

impl PushOutcome {
    /// Whether the destination holds a copy afterwards.
    pub fn is_success(&self) -> bool {
        matches!(self, PushOutcome::Delivered | PushOutcome::AlreadyHeld)
    }
}

/// Per-destination outcomes of one replication round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    pub memo: MemoId,
    pub outcomes: Vec<(SlabId, PushOutcome)>,
}

impl ReplicationReport {
    pub fn failed(&self) -> impl Iterator<Item = (&SlabId, DropReason)> {
        self.outcomes.iter().filter_map(|(slab, o)| match o {
            PushOutcome::Dropped(reason) => Some((slab, *reason)),
            _ => None,
        })
    }
}

type Completion = Box<dyn FnOnce(ReplicationReport) + Send>;

struct JoinInner {
    memo: MemoId,
    pending: usize,
    sealed: bool,
    outcomes: Vec<(SlabId, PushOutcome)>,
    on_complete: Option<Completion>,
}

impl JoinInner {
    /// Take the completion if the join is finished.
    fn take_ready(&mut self) -> Option<(Completion, ReplicationReport)> {
        if !self.sealed || self.pending > 0 {
            return None;
        }
        let done = self.on_complete.take()?;
        let report = ReplicationReport {
            memo: self.memo.clone(),
            outcomes: std::mem::take(&mut self.outcomes),
        };
        Some((done, report))
    }
}

/// Waits for a set of pushes, then reports once.
pub struct PushJoin {
    inner: Arc<Mutex<JoinInner>>,
}

impl PushJoin {
    pub fn new(
        memo: MemoId,
        on_complete: impl FnOnce(ReplicationReport) + Send + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(JoinInner {
                memo,
                pending: 0,
                sealed: false,
                outcomes: Vec::new(),
                on_complete: Some(Box::new(on_complete)),
            })),
        }
    }

    /// Register one more outstanding push.
    pub fn ticket(&self, to: SlabId) -> PushTicket {
        lock(&self.inner).pending += 1;
        PushTicket {
            join: Arc::clone(&self.inner),
            to,
            settled: false,
        }
    }

    /// No more tickets will be issued.
    pub fn seal(self) {
        let ready = {
            let mut inner = lock(&self.inner);
            inner.sealed = true;
            inner.take_ready()
        };
        if let Some((done, report)) = ready {
            done(report);
        }
    }
}

/// One outstanding push. Dropping it unsettled counts as
/// [`DropReason::Abandoned`].
pub struct PushTicket {
    join: Arc<Mutex<JoinInner>>,
    to: SlabId,
    settled: bool,
}

impl PushTicket {
    pub fn settle(mut self, outcome: PushOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: PushOutcome) {
        if self.settled {
            return;
        }
        self.settled = true;
        let ready = {
            let mut inner = lock(&self.join);
            inner.pending = inner.pending.saturating_sub(1);
            inner.outcomes.push((self.to.clone(), outcome));
            let pending = inner.pending;
            trace!(memo = %inner.memo, to = %self.to, ?outcome, pending, "Push settled");
            inner.take_ready()
        };
        if let Some((done, report)) = ready {
            done(report);
        }
    }
}

impl Drop for PushTicket {
    fn drop(&mut self) {
        self.finish(PushOutcome::Dropped(DropReason::Abandoned));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn slab(name: &str) -> SlabId {
        SlabId::new(name).unwrap()
    }

    fn join() -> (PushJoin, mpsc::Receiver<ReplicationReport>) {
        let (tx, rx) = mpsc::channel();
        let join = PushJoin::new("A-1".parse().unwrap(), move |report| {
            tx.send(report).unwrap();
        });
        (join, rx)
    }

    #[test]
    fn completes_after_last_ticket() {
        let (join, rx) = join();
        let b = join.ticket(slab("B"));
        let c = join.ticket(slab("C"));
        join.seal();

        b.settle(PushOutcome::Delivered);
        assert!(rx.try_recv().is_err());

        c.settle(PushOutcome::Dropped(DropReason::AtCapacity));
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcomes[0], (slab("B"), PushOutcome::Delivered));
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed, vec![(&slab("C"), DropReason::AtCapacity)]);
    }

    #[test]
    fn waits_for_seal() {
        let (join, rx) = join();
        join.ticket(slab("B")).settle(PushOutcome::AlreadyHeld);
        assert!(rx.try_recv().is_err());
        join.seal();
        assert_eq!(rx.try_recv().unwrap().outcomes.len(), 1);
    }

    #[test]
    fn empty_join_completes_on_seal() {
        let (join, rx) = join();
        join.seal();
        assert!(rx.try_recv().unwrap().outcomes.is_empty());
    }

    #[test]
    fn dropped_ticket_counts_as_abandoned() {
        let (join, rx) = join();
        let ticket = join.ticket(slab("D"));
        join.seal();
        drop(ticket);
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcomes, vec![(slab("D"), PushOutcome::Dropped(DropReason::Abandoned))]);
    }

    #[test]
    fn completion_runs_once() {
        let (join, rx) = join();
        let ticket = join.ticket(slab("B"));
        join.seal();
        ticket.settle(PushOutcome::Delivered);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
