//! The simulated network connecting slabs.
//!
//! The mesh keeps a registry of slabs in registration order, picks replica
//! targets, and carries messages between slabs as JSON strings:
//!
//! - memo pushes, answered through a callback with a [`PushOutcome`]
//! - peering deltas, fire and forget
//! - memo requests from a slab missing a memo, and the memos sent back
//!
//! A requested memo is not a replica push: it skips the capacity check and
//! nobody waits on its outcome.
//!
//! ## Delivery
//!
//! Connected: each message is its own tokio task that sleeps for a delay
//! drawn from the [`LatencyModel`] and then delivers. Ordering across
//! messages is not guaranteed.
//!
//! Disconnected: messages queue until [`Mesh::deliver_all_queued_messages`],
//! which delivers a snapshot of the queue in FIFO order. Anything enqueued
//! while that snapshot is being delivered waits for the next call.
//!
//! Delivery never happens inside the call that sent the message, and the
//! mesh never holds one of its own locks while calling into a slab.

mod events;
mod latency;
mod selection;

pub use events::MeshEvent;
pub use latency::LatencyModel;
pub use selection::{RegistrationOrder, RoundRobin, SelectionStrategy, Shuffled};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::id::{MemoId, SlabId};
use crate::memo::Memo;
use crate::peering::{PeeringChanges, PeeringDeltas, Peerings};
use crate::replication::{DropReason, PushOutcome};
use crate::wire::{MemoPacket, MemoRequest, PeeringMessage};
use crate::{lock, read, write};

/// What the mesh needs from a slab.
///
/// Capacity reads must not take the slab's state lock: the mesh calls them
/// while a different slab may be mid-operation.
pub trait SlabHandle: Send + Sync {
    fn id(&self) -> &SlabId;

    /// Room left below the soft quota.
    fn quota_remaining(&self) -> usize;

    /// Room left below the hard limit.
    fn limit_remaining(&self) -> usize;

    fn receive_memo(&self, from: &SlabId, packet: MemoPacket) -> PushOutcome;

    fn receive_peering_change(&self, from: &SlabId, deltas: &PeeringDeltas);

    /// `from` asks for memos it does not hold.
    fn receive_memo_request(&self, from: &SlabId, ids: &[MemoId]);

    /// A memo sent back in answer to a request.
    fn receive_requested_memo(&self, from: &SlabId, packet: MemoPacket);
}

type PushCallback = Box<dyn FnOnce(PushOutcome) + Send>;

enum Message {
    Memo {
        memo_id: MemoId,
        /// `None` if the packet failed to encode
        packet: Option<String>,
        callback: PushCallback,
    },
    Peering {
        packet: String,
    },
    Request {
        packet: String,
    },
    Reply {
        memo_id: MemoId,
        packet: Option<String>,
    },
}

struct Envelope {
    from: SlabId,
    to: SlabId,
    message: Message,
}

enum Route {
    Queue,
    Spawn(Handle, Duration),
}

struct Registration {
    id: SlabId,
    handle: Weak<dyn SlabHandle>,
}

struct MeshInner {
    config: MeshConfig,
    slabs: RwLock<Vec<Registration>>,
    queue: Mutex<VecDeque<Envelope>>,
    disconnected: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    next_slab: AtomicU64,
    strategy: Mutex<Box<dyn SelectionStrategy>>,
    rng: Mutex<StdRng>,
    events: broadcast::Sender<MeshEvent>,
    started: Instant,
}

/// Shared handle to the simulated network. Cheap to clone.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

impl Mesh {
    pub fn new(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (events, _) = broadcast::channel(config.event_capacity);
        info!(
            disconnected = config.disconnected,
            latency = ?config.latency,
            "Mesh created"
        );
        Ok(Self {
            inner: Arc::new(MeshInner {
                disconnected: AtomicBool::new(config.disconnected),
                config,
                slabs: RwLock::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                next_slab: AtomicU64::new(0),
                strategy: Mutex::new(Box::new(RoundRobin::default())),
                rng: Mutex::new(rng),
                events,
                started: Instant::now(),
            }),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// Replace the replica selection strategy.
    pub fn set_selection_strategy(&self, strategy: impl SelectionStrategy + 'static) {
        debug!(?strategy, "Selection strategy changed");
        *lock(&self.inner.strategy) = Box::new(strategy);
    }

    /// A slab id no live registered slab is using.
    pub fn allocate_slab_id(&self) -> SlabId {
        loop {
            let n = self.inner.next_slab.fetch_add(1, Ordering::Relaxed);
            let id = SlabId::from_counter(n);
            if self.lookup(&id).is_none() {
                return id;
            }
        }
    }

    /// Register a slab. Registering the same slab again is a no-op; a
    /// different live slab under a taken id is refused.
    pub fn register_slab(&self, handle: &Arc<dyn SlabHandle>) -> Result<()> {
        let id = handle.id().clone();
        let weak = Arc::downgrade(handle);
        let mut slabs = write(&self.inner.slabs);
        slabs.retain(|r| r.handle.strong_count() > 0);

        if let Some(existing) = slabs.iter().find(|r| r.id == id) {
            if Weak::ptr_eq(&existing.handle, &weak) {
                return Ok(());
            }
            return Err(Error::DuplicateSlab(id));
        }

        slabs.push(Registration {
            id: id.clone(),
            handle: weak,
        });
        info!(slab = %id, known = slabs.len(), "Slab registered");
        Ok(())
    }

    /// Live registered slabs.
    pub fn known_slab_count(&self) -> usize {
        read(&self.inner.slabs)
            .iter()
            .filter(|r| r.handle.strong_count() > 0)
            .count()
    }

    /// Up to `count` live slabs not in `exclude` that have quota to spare.
    pub fn get_accepting_slabs(
        &self,
        exclude: &[SlabId],
        count: usize,
    ) -> Vec<Arc<dyn SlabHandle>> {
        if count == 0 {
            return Vec::new();
        }
        let candidates: Vec<Arc<dyn SlabHandle>> = read(&self.inner.slabs)
            .iter()
            .filter(|r| !exclude.contains(&r.id))
            .filter_map(|r| r.handle.upgrade())
            .collect();
        let accepting = candidates
            .into_iter()
            .filter(|h| h.quota_remaining() > 0)
            .collect();
        lock(&self.inner.strategy).select(accepting, count)
    }

    /// Send a memo. `callback` runs once the push is delivered or dropped,
    /// never from inside this call.
    pub fn push_memo_to_slab(
        &self,
        from: &SlabId,
        to: &SlabId,
        memo: &Memo,
        peerings: Peerings,
        callback: impl FnOnce(PushOutcome) + Send + 'static,
    ) {
        let packet = match MemoPacket::from_memo(memo, peerings).encode() {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(memo = %memo.id(), error = %e, "Failed to encode memo packet");
                None
            }
        };

        let route = self.route();
        self.emit(MeshEvent::MemoEmitted {
            from: from.clone(),
            to: to.clone(),
            memo_id: memo.id().clone(),
            emit_ms: self.elapsed_ms(),
            deliver_ms: match &route {
                Route::Spawn(_, delay) => Some(self.elapsed_ms() + millis(*delay)),
                Route::Queue => None,
            },
        });
        debug!(%from, %to, memo = %memo.id(), "Memo pushed");

        self.send(
            Envelope {
                from: from.clone(),
                to: to.clone(),
                message: Message::Memo {
                    memo_id: memo.id().clone(),
                    packet,
                    callback: Box::new(callback),
                },
            },
            route,
        );
    }

    /// Send each destination its deltas. Fire and forget.
    pub fn send_peering_changes(&self, from: &SlabId, changes: PeeringChanges) {
        for (to, deltas) in changes {
            if deltas.is_empty() || to == *from {
                continue;
            }
            let message = PeeringMessage {
                from: from.clone(),
                to: to.clone(),
                deltas,
            };
            let packet = match message.encode() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(%from, %to, error = %e, "Failed to encode peering message");
                    continue;
                }
            };

            let route = self.route();
            trace!(%from, %to, deltas = ?message.deltas, "Peering change sent");
            self.emit(MeshEvent::PeeringSent {
                from: from.clone(),
                to: to.clone(),
                deltas: message.deltas,
                at_ms: self.elapsed_ms(),
            });
            self.send(
                Envelope {
                    from: from.clone(),
                    to,
                    message: Message::Peering { packet },
                },
                route,
            );
        }
    }

    /// Ask `to` for memos `from` is missing. Fire and forget: whatever `to`
    /// holds comes back through [`Mesh::send_requested_memo`].
    pub fn request_memos(&self, from: &SlabId, to: &SlabId, ids: Vec<MemoId>) {
        if ids.is_empty() || to == from {
            return;
        }
        let request = MemoRequest {
            from: from.clone(),
            to: to.clone(),
            ids,
        };
        let packet = match request.encode() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(%from, %to, error = %e, "Failed to encode memo request");
                return;
            }
        };

        let route = self.route();
        debug!(%from, %to, ids = ?request.ids, "Memos requested");
        self.emit(MeshEvent::MemoRequested {
            from: from.clone(),
            to: to.clone(),
            memo_ids: request.ids,
            at_ms: self.elapsed_ms(),
        });
        self.send(
            Envelope {
                from: from.clone(),
                to: to.clone(),
                message: Message::Request { packet },
            },
            route,
        );
    }

    /// Answer a request with one memo.
    pub fn send_requested_memo(&self, from: &SlabId, to: &SlabId, memo: &Memo, peerings: Peerings) {
        let packet = match MemoPacket::from_memo(memo, peerings).encode() {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!(memo = %memo.id(), error = %e, "Failed to encode requested memo");
                None
            }
        };

        let route = self.route();
        self.emit(MeshEvent::MemoEmitted {
            from: from.clone(),
            to: to.clone(),
            memo_id: memo.id().clone(),
            emit_ms: self.elapsed_ms(),
            deliver_ms: match &route {
                Route::Spawn(_, delay) => Some(self.elapsed_ms() + millis(*delay)),
                Route::Queue => None,
            },
        });
        trace!(%from, %to, memo = %memo.id(), "Requested memo sent");

        self.send(
            Envelope {
                from: from.clone(),
                to: to.clone(),
                message: Message::Reply {
                    memo_id: memo.id().clone(),
                    packet,
                },
            },
            route,
        );
    }

    /// Deliver everything queued so far, in order. Returns how many
    /// messages were delivered.
    pub fn deliver_all_queued_messages(&self) -> usize {
        let batch: Vec<Envelope> = lock(&self.inner.queue).drain(..).collect();
        let count = batch.len();
        if count > 0 {
            debug!(count, "Delivering queued messages");
        }
        for envelope in batch {
            self.deliver(envelope);
        }
        count
    }

    /// Messages waiting for a flush.
    pub fn pending_message_count(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Messages currently sleeping in delivery tasks.
    pub fn in_flight_message_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::Acquire)
    }

    /// Switch delivery mode. Reconnecting schedules everything still
    /// queued with the usual latency.
    pub fn set_disconnected(&self, disconnected: bool) {
        let was = self.inner.disconnected.swap(disconnected, Ordering::AcqRel);
        if was == disconnected {
            return;
        }
        info!(disconnected, "Mesh delivery mode changed");
        if !disconnected {
            let queued: Vec<Envelope> = lock(&self.inner.queue).drain(..).collect();
            for envelope in queued {
                let route = self.route();
                self.send(envelope, route);
            }
        }
    }

    /// Wait until no delivery task is in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight_message_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight_message_count() == 0;
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Milliseconds since the mesh was created.
    pub fn elapsed_ms(&self) -> u64 {
        millis(self.inner.started.elapsed())
    }

    fn lookup(&self, id: &SlabId) -> Option<Arc<dyn SlabHandle>> {
        read(&self.inner.slabs)
            .iter()
            .find(|r| r.id == *id)
            .and_then(|r| r.handle.upgrade())
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn route(&self) -> Route {
        if self.is_disconnected() {
            return Route::Queue;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let delay = self.inner.config.latency.sample(&mut *lock(&self.inner.rng));
                Route::Spawn(handle, delay)
            }
            Err(_) => {
                warn!("No async runtime available, queueing message");
                Route::Queue
            }
        }
    }

    fn send(&self, envelope: Envelope, route: Route) {
        match route {
            Route::Queue => lock(&self.inner.queue).push_back(envelope),
            Route::Spawn(handle, delay) => {
                self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
                let mesh = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    mesh.deliver(envelope);
                    if mesh.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                        mesh.inner.idle.notify_waiters();
                    }
                });
            }
        }
    }

    fn report(&self, from: SlabId, to: SlabId, memo_id: MemoId, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Dropped(reason) => {
                debug!(%from, %to, memo = %memo_id, %reason, "Memo dropped");
                self.emit(MeshEvent::MemoDropped {
                    from,
                    to,
                    memo_id,
                    reason,
                    at_ms: self.elapsed_ms(),
                });
            }
            _ => {
                trace!(%from, %to, memo = %memo_id, ?outcome, "Memo delivered");
                self.emit(MeshEvent::MemoDelivered {
                    slab: to,
                    from,
                    memo_id,
                    delivered_ms: self.elapsed_ms(),
                });
            }
        }
    }

    fn deliver(&self, envelope: Envelope) {
        let Envelope { from, to, message } = envelope;
        let target = self.lookup(&to);

        match message {
            Message::Memo {
                memo_id,
                packet,
                callback,
            } => {
                let outcome = match (target, packet) {
                    (None, _) => PushOutcome::Dropped(DropReason::UnknownSlab),
                    (Some(_), None) => PushOutcome::Dropped(DropReason::Malformed),
                    (Some(slab), Some(raw)) => {
                        if slab.limit_remaining() == 0 {
                            PushOutcome::Dropped(DropReason::AtCapacity)
                        } else {
                            match MemoPacket::decode(&raw) {
                                Ok(packet) => slab.receive_memo(&from, packet),
                                Err(e) => {
                                    warn!(
                                        %from, %to, memo = %memo_id, error = %e,
                                        "Malformed memo packet"
                                    );
                                    PushOutcome::Dropped(DropReason::Malformed)
                                }
                            }
                        }
                    }
                };

                self.report(from, to, memo_id, outcome);
                callback(outcome);
            }
            Message::Reply { memo_id, packet } => {
                let outcome = match (target, packet) {
                    (None, _) => PushOutcome::Dropped(DropReason::UnknownSlab),
                    (Some(_), None) => PushOutcome::Dropped(DropReason::Malformed),
                    (Some(slab), Some(raw)) => match MemoPacket::decode(&raw) {
                        Ok(packet) => {
                            slab.receive_requested_memo(&from, packet);
                            PushOutcome::Delivered
                        }
                        Err(e) => {
                            warn!(%from, %to, memo = %memo_id, error = %e, "Malformed reply");
                            PushOutcome::Dropped(DropReason::Malformed)
                        }
                    },
                };
                self.report(from, to, memo_id, outcome);
            }
            Message::Request { packet } => {
                let Some(slab) = target else {
                    trace!(%from, %to, "Memo request for unknown slab discarded");
                    return;
                };
                match MemoRequest::decode(&packet) {
                    Ok(request) => slab.receive_memo_request(&request.from, &request.ids),
                    Err(e) => warn!(%from, %to, error = %e, "Malformed memo request"),
                }
            }
            Message::Peering { packet } => {
                let Some(slab) = target else {
                    trace!(%from, %to, "Peering change for unknown slab discarded");
                    return;
                };
                match PeeringMessage::decode(&packet) {
                    Ok(message) => slab.receive_peering_change(&message.from, &message.deltas),
                    Err(e) => warn!(%from, %to, error = %e, "Malformed peering message"),
                }
            }
        }
    }
}

impl fmt::Debug for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh")
            .field("known_slabs", &self.known_slab_count())
            .field("disconnected", &self.is_disconnected())
            .field("pending", &self.pending_message_count())
            .field("in_flight", &self.in_flight_message_count())
            .finish()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
