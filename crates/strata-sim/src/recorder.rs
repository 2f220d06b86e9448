//! Mesh event recording.
//!
//! Stands in for the visualization collaborator: it listens to what the
//! mesh emits and keeps enough to draw memos in transit.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use strata_store::{MemoId, Mesh, MeshEvent, SlabId};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, trace, warn};

/// Aggregate view of a recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransitSummary {
    pub emitted: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub peering_messages: usize,
    /// Requests for memos a slab was missing
    pub memo_requests: usize,
    /// Events lost because the recorder fell behind
    pub lagged: u64,
    /// Mean emit-to-delivery time of matched pushes
    pub mean_transit_ms: Option<f64>,
}

pub struct EventRecorder {
    rx: broadcast::Receiver<MeshEvent>,
    events: Vec<MeshEvent>,
    in_transit: HashMap<(SlabId, SlabId, MemoId), VecDeque<u64>>,
    transits: Vec<u64>,
    lagged: u64,
}

impl EventRecorder {
    /// Start listening. Only events emitted from now on are seen.
    pub fn new(mesh: &Mesh) -> Self {
        Self {
            rx: mesh.subscribe_events(),
            events: Vec::new(),
            in_transit: HashMap::new(),
            transits: Vec::new(),
            lagged: 0,
        }
    }

    /// Take everything emitted so far. Returns how many events were new.
    pub fn collect(&mut self) -> usize {
        let mut count = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.observe(&event);
                    self.events.push(event);
                    count += 1;
                }
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Event recorder fell behind");
                    self.lagged += missed;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        count
    }

    pub fn events(&self) -> &[MeshEvent] {
        &self.events
    }

    /// Events concerning one memo, in arrival order.
    pub fn events_for<'a>(&'a self, memo: &'a MemoId) -> impl Iterator<Item = &'a MeshEvent> + 'a {
        self.events.iter().filter(move |e| e.memo_id() == Some(memo))
    }

    pub fn summary(&self) -> TransitSummary {
        let mut summary = TransitSummary {
            lagged: self.lagged,
            ..TransitSummary::default()
        };
        for event in &self.events {
            match event {
                MeshEvent::MemoEmitted { .. } => summary.emitted += 1,
                MeshEvent::MemoDelivered { .. } => summary.delivered += 1,
                MeshEvent::MemoDropped { .. } => summary.dropped += 1,
                MeshEvent::MemoRequested { .. } => summary.memo_requests += 1,
                MeshEvent::PeeringSent { .. } => summary.peering_messages += 1,
            }
        }
        if !self.transits.is_empty() {
            let total: u64 = self.transits.iter().sum();
            summary.mean_transit_ms = Some(total as f64 / self.transits.len() as f64);
        }
        summary
    }

    fn observe(&mut self, event: &MeshEvent) {
        match event {
            MeshEvent::MemoEmitted {
                from,
                to,
                memo_id,
                emit_ms,
                deliver_ms,
            } => {
                debug!(%from, %to, memo = %memo_id, emit_ms, ?deliver_ms, "Memo in transit");
                self.in_transit
                    .entry((from.clone(), to.clone(), memo_id.clone()))
                    .or_default()
                    .push_back(*emit_ms);
            }
            MeshEvent::MemoDelivered {
                slab,
                from,
                memo_id,
                delivered_ms,
            } => {
                let emitted = self.take_emit(from, slab, memo_id);
                let transit_ms = emitted.map(|at| delivered_ms.saturating_sub(at));
                if let Some(ms) = transit_ms {
                    self.transits.push(ms);
                }
                debug!(%from, to = %slab, memo = %memo_id, ?transit_ms, "Memo arrived");
            }
            MeshEvent::MemoDropped {
                from,
                to,
                memo_id,
                reason,
                ..
            } => {
                self.take_emit(from, to, memo_id);
                debug!(%from, %to, memo = %memo_id, %reason, "Memo dropped");
            }
            MeshEvent::MemoRequested {
                from, to, memo_ids, ..
            } => {
                debug!(%from, %to, ?memo_ids, "Memos requested");
            }
            MeshEvent::PeeringSent { from, to, deltas, .. } => {
                trace!(%from, %to, ?deltas, "Peering gossip");
            }
        }
    }

    fn take_emit(&mut self, from: &SlabId, to: &SlabId, memo: &MemoId) -> Option<u64> {
        let key = (from.clone(), to.clone(), memo.clone());
        let queue = self.in_transit.get_mut(&key)?;
        let at = queue.pop_front();
        if queue.is_empty() {
            self.in_transit.remove(&key);
        }
        at
    }
}
