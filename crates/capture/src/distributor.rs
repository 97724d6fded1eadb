use crate::types::{FrameMetadata, RawFrame, StreamId, Timestamp};
use common::span_debug;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

/// Selects which frames a registered consumer receives, against each frame's
/// own stream id and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerFilter {
    Stream(StreamId),
    Timestamp(Timestamp),
}

impl ConsumerFilter {
    fn matches(&self, frame: &RawFrame) -> bool {
        match self {
            ConsumerFilter::Stream(stream) => frame.stream == *stream,
            ConsumerFilter::Timestamp(timestamp) => frame.timestamp == *timestamp,
        }
    }
}

/// Why a consumer lost a frame it matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The pool hit capacity and this frame was the oldest outstanding one.
    PoolFull,
    /// The frame aged past the pairing window without its metadata.
    Expired,
}

/// Delivery to one consumer.
#[derive(Debug)]
pub enum ConsumerEvent {
    /// A correlated frame/metadata pair.
    Frame(FrameLease, FrameMetadata),
    /// A frame this consumer matched was dropped; after a `PoolFull` drop of
    /// an already-delivered frame the lease stays readable, but its pool
    /// slot has been reclaimed.
    Dropped {
        timestamp: Timestamp,
        reason: DropReason,
    },
}

#[derive(Debug)]
struct PoolCounter(AtomicUsize);

impl PoolCounter {
    fn admit(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }

    fn occupancy(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

/// Pool-slot accounting for one admitted frame. The slot frees exactly once,
/// on whichever comes first: the last lease drop or a distributor-side void
/// during eviction. Only atomics here, so a lease can drop anywhere without
/// touching the distributor lock.
#[derive(Debug)]
struct Ticket {
    pool: Arc<PoolCounter>,
    settled: AtomicBool,
}

impl Ticket {
    fn settle(&self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.pool.release();
        }
    }

    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.settle();
    }
}

/// Shared handle to one delivered frame. Clones share the pool slot; it is
/// reclaimed when the last clone drops.
#[derive(Debug, Clone)]
pub struct FrameLease {
    frame: Arc<RawFrame>,
    ticket: Arc<Ticket>,
}

impl FrameLease {
    pub fn frame(&self) -> &RawFrame {
        &self.frame
    }

    pub fn timestamp(&self) -> Timestamp {
        self.frame.timestamp
    }
}

struct PendingExposure {
    /// Frames waiting for this timestamp's metadata, one per stream.
    frames: Vec<(Arc<RawFrame>, Arc<Ticket>)>,
    metadata: Option<FrameMetadata>,
}

struct ConsumerSlot {
    id: u64,
    filter: ConsumerFilter,
    tx: mpsc::UnboundedSender<ConsumerEvent>,
}

struct Outstanding {
    timestamp: Timestamp,
    stream: StreamId,
    ticket: Weak<Ticket>,
    /// Consumer ids the frame was delivered to; empty while still pending.
    delivered_to: Vec<u64>,
}

struct DistributorState {
    pending: BTreeMap<Timestamp, PendingExposure>,
    consumers: Vec<ConsumerSlot>,
    /// Admission order of live pool tickets, oldest first.
    outstanding: VecDeque<Outstanding>,
    newest: Timestamp,
}

struct DistributorShared {
    state: Mutex<DistributorState>,
    pool: Arc<PoolCounter>,
    capacity: usize,
    pairing_window: Duration,
    next_consumer: AtomicU64,
}

impl DistributorShared {
    fn lock(&self) -> MutexGuard<'_, DistributorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Oldest timestamp still inside the pairing window.
    fn cutoff(&self, newest: Timestamp) -> Timestamp {
        let window = self.pairing_window.as_nanos() as u64;
        Timestamp(newest.0.saturating_sub(window))
    }
}

/// Routes frames from the device's output queue to the logical consumers
/// registered for them, correlating each frame with its metadata bundle by
/// timestamp.
///
/// Both intake calls are synchronous and never block: the producer side is
/// protected by a bounded pool with oldest-first eviction, and deliveries go
/// through per-consumer unbounded queues.
pub struct FrameDistributor {
    shared: Arc<DistributorShared>,
}

impl FrameDistributor {
    pub fn new(capacity: usize, pairing_window: Duration) -> Self {
        Self {
            shared: Arc::new(DistributorShared {
                state: Mutex::new(DistributorState {
                    pending: BTreeMap::new(),
                    consumers: Vec::new(),
                    outstanding: VecDeque::new(),
                    newest: Timestamp(0),
                }),
                pool: Arc::new(PoolCounter(AtomicUsize::new(0))),
                capacity: capacity.max(1),
                pairing_window,
                next_consumer: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a consumer. Matching frames arriving after this call are
    /// delivered once both halves of the pair are in.
    pub fn register(&self, filter: ConsumerFilter) -> FrameConsumer {
        let id = self.shared.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .lock()
            .consumers
            .push(ConsumerSlot { id, filter, tx });
        FrameConsumer {
            id,
            rx,
            shared: self.shared.clone(),
        }
    }

    /// Frames currently holding pool slots.
    pub fn occupancy(&self) -> usize {
        self.shared.pool.occupancy()
    }

    /// Intake for a device frame.
    pub fn on_frame(&self, frame: RawFrame) {
        let _s = span_debug!("distribute_frame");
        let mut state = self.shared.lock();

        let matched = state.consumers.iter().any(|c| c.filter.matches(&frame));
        if !matched {
            tracing::debug!(
                timestamp = %frame.timestamp,
                stream = %frame.stream,
                "frame matched no consumer, released"
            );
            self.observe(&mut state, frame.timestamp);
            return;
        }

        // A frame already older than the pairing window can never pair; its
        // metadata, if it ever existed, has been pruned. Refuse it a slot so
        // it cannot push out a live frame.
        if frame.timestamp < self.shared.cutoff(state.newest) {
            tracing::debug!(
                timestamp = %frame.timestamp,
                stream = %frame.stream,
                "frame older than the pairing window, released"
            );
            self.notify_matching(&mut state, &frame, DropReason::Expired);
            return;
        }

        if self.shared.pool.occupancy() >= self.shared.capacity {
            self.evict_oldest(&mut state);
        }
        self.shared.pool.admit();
        let ticket = Arc::new(Ticket {
            pool: self.shared.pool.clone(),
            settled: AtomicBool::new(false),
        });
        let timestamp = frame.timestamp;
        let stream = frame.stream;
        state.outstanding.push_back(Outstanding {
            timestamp,
            stream,
            ticket: Arc::downgrade(&ticket),
            delivered_to: Vec::new(),
        });

        let frame = Arc::new(frame);
        let entry = state
            .pending
            .entry(timestamp)
            .or_insert_with(|| PendingExposure {
                frames: Vec::new(),
                metadata: None,
            });
        match entry.metadata.clone() {
            Some(metadata) => {
                self.deliver(&mut state, frame, ticket, &metadata);
            }
            None => {
                entry.frames.push((frame, ticket));
            }
        }

        self.observe(&mut state, timestamp);
    }

    /// Intake for a metadata bundle.
    pub fn on_metadata(&self, metadata: FrameMetadata) {
        let mut state = self.shared.lock();
        let timestamp = metadata.timestamp;

        let entry = state
            .pending
            .entry(timestamp)
            .or_insert_with(|| PendingExposure {
                frames: Vec::new(),
                metadata: None,
            });
        entry.metadata = Some(metadata.clone());
        let waiting = std::mem::take(&mut entry.frames);
        for (frame, ticket) in waiting {
            self.deliver(&mut state, frame, ticket, &metadata);
        }

        self.observe(&mut state, timestamp);
    }

    /// Drops every consumer and pending frame. Queued deliveries stay
    /// readable; receivers see the end of their channel afterwards.
    pub(crate) fn close(&self) {
        let mut state = self.shared.lock();
        state.consumers.clear();
        state.pending.clear();
        state.outstanding.clear();
    }

    /// Hands a paired frame to every consumer matching it now. A pair that
    /// matches nobody settles its ticket on the spot.
    fn deliver(
        &self,
        state: &mut DistributorState,
        frame: Arc<RawFrame>,
        ticket: Arc<Ticket>,
        metadata: &FrameMetadata,
    ) {
        let mut delivered_to = Vec::new();
        let mut dead = Vec::new();
        for slot in &state.consumers {
            if !slot.filter.matches(&frame) {
                continue;
            }
            let lease = FrameLease {
                frame: frame.clone(),
                ticket: ticket.clone(),
            };
            let event = ConsumerEvent::Frame(lease, metadata.clone());
            if slot.tx.send(event).is_ok() {
                delivered_to.push(slot.id);
            } else {
                dead.push(slot.id);
            }
        }
        state.consumers.retain(|c| !dead.contains(&c.id));

        if delivered_to.is_empty() {
            tracing::debug!(
                timestamp = %frame.timestamp,
                stream = %frame.stream,
                "paired frame matched no consumer, released"
            );
            ticket.settle();
            return;
        }

        let stream = frame.stream;
        let timestamp = frame.timestamp;
        if let Some(entry) = state
            .outstanding
            .iter_mut()
            .find(|o| o.timestamp == timestamp && o.stream == stream)
        {
            entry.delivered_to = delivered_to;
        }
    }

    /// Reclaims the slot of the oldest live frame. A pending frame is
    /// dropped outright; a delivered frame keeps its lease readable but has
    /// the ticket voided. Either way its consumers get a `PoolFull` notice.
    fn evict_oldest(&self, state: &mut DistributorState) {
        while let Some(oldest) = state.outstanding.pop_front() {
            let ticket = match oldest.ticket.upgrade() {
                Some(ticket) if !ticket.is_settled() => ticket,
                _ => continue,
            };

            let pending_frame = state.pending.get_mut(&oldest.timestamp).and_then(|entry| {
                entry
                    .frames
                    .iter()
                    .position(|(f, _)| f.stream == oldest.stream)
                    .map(|i| entry.frames.swap_remove(i).0)
            });

            tracing::warn!(
                timestamp = %oldest.timestamp,
                stream = %oldest.stream,
                delivered = pending_frame.is_none(),
                "pool full, evicting oldest frame"
            );
            ticket.settle();

            match pending_frame {
                Some(frame) => {
                    self.notify_matching(state, &frame, DropReason::PoolFull);
                }
                None => {
                    self.notify_ids(state, &oldest.delivered_to, oldest.timestamp);
                }
            }
            return;
        }
    }

    fn notify_matching(&self, state: &mut DistributorState, frame: &RawFrame, reason: DropReason) {
        for slot in &state.consumers {
            if slot.filter.matches(frame) {
                let _ = slot.tx.send(ConsumerEvent::Dropped {
                    timestamp: frame.timestamp,
                    reason,
                });
            }
        }
    }

    fn notify_ids(&self, state: &mut DistributorState, ids: &[u64], timestamp: Timestamp) {
        for slot in &state.consumers {
            if ids.contains(&slot.id) {
                let _ = slot.tx.send(ConsumerEvent::Dropped {
                    timestamp,
                    reason: DropReason::PoolFull,
                });
            }
        }
    }

    /// Advances the device clock watermark and expires pending halves older
    /// than the pairing window.
    fn observe(&self, state: &mut DistributorState, timestamp: Timestamp) {
        if timestamp > state.newest {
            state.newest = timestamp;
        }
        let cutoff = self.shared.cutoff(state.newest);

        while let Some((&timestamp, _)) = state.pending.first_key_value() {
            if timestamp >= cutoff {
                break;
            }
            let entry = match state.pending.remove(&timestamp) {
                Some(entry) => entry,
                None => break,
            };
            if entry.frames.is_empty() {
                tracing::trace!(%timestamp, "unpaired metadata expired");
                continue;
            }
            for (frame, ticket) in entry.frames {
                tracing::debug!(
                    %timestamp,
                    stream = %frame.stream,
                    "unpaired frame expired"
                );
                ticket.settle();
                self.notify_matching(state, &frame, DropReason::Expired);
            }
        }

        state
            .outstanding
            .retain(|o| o.ticket.upgrade().is_some_and(|t| !t.is_settled()));
    }
}

/// Receiving side of a registration. Dropping it unregisters the filter.
pub struct FrameConsumer {
    id: u64,
    rx: mpsc::UnboundedReceiver<ConsumerEvent>,
    shared: Arc<DistributorShared>,
}

impl FrameConsumer {
    /// Next delivery or drop notice. `None` once the distributor has closed
    /// and the backlog is drained.
    pub async fn next_event(&mut self) -> Option<ConsumerEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<ConsumerEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        self.shared.lock().consumers.retain(|c| c.id != self.id);
    }
}
