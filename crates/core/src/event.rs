//! Discrete-event machinery.
//!
//! Events are totally ordered by `(time, priority, seq)`: the scheduled
//! tick, a per-kind priority that fixes same-tick ordering along the
//! request pipeline, and a monotonically increasing insertion index that
//! breaks the remaining ties deterministically.

use blis_types::{InstanceId, RequestId, Ticks};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// A request arrives at the cluster boundary.
    ClusterArrival(RequestId),
    /// The admission policy rules on a pending arrival.
    AdmissionDecision(RequestId),
    /// The router picks a target instance for an admitted request.
    RoutingDecision(RequestId),
    /// A routed request lands in its instance's wait queue.
    Queued(RequestId),
    /// One continuous-batching iteration on an instance.
    Step,
}

impl EventKind {
    /// Same-tick ordering follows the pipeline: arrivals are decided before
    /// admissions, admissions before routing, and steps run last so they
    /// observe every request queued at that tick.
    pub fn priority(&self) -> u8 {
        match self {
            EventKind::ClusterArrival(_) => 0,
            EventKind::AdmissionDecision(_) => 1,
            EventKind::RoutingDecision(_) => 2,
            EventKind::Queued(_) => 3,
            EventKind::Step => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub time: Ticks,
    pub kind: EventKind,
    /// Instance the event belongs to; `None` for cluster-level events.
    pub instance: Option<InstanceId>,
    seq: u64,
}

impl Event {
    fn sort_key(&self) -> (Ticks, u8, u64) {
        (self.time, self.kind.priority(), self.seq)
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we pop the earliest event.
        other.sort_key().cmp(&self.sort_key())
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-ordered event queue with a deterministic pop order.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time: Ticks, kind: EventKind, instance: Option<InstanceId>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Event {
            time,
            kind,
            instance,
            seq,
        });
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop()
    }

    /// `(time, priority)` of the earliest pending event.
    pub fn peek_key(&self) -> Option<(Ticks, u8)> {
        self.heap.peek().map(|e| (e.time, e.kind.priority()))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}
