// =============================================================================
// priority.rs - THE WAITING ROOM
// =============================================================================
//
// When the token jar is empty, callers wait here, ordered by priority (live
// polling first) and then by arrival. The room has a fixed number of chairs.
// When it is full, the lowest-priority waiter is shown the door, but only to
// make room for someone more important. Otherwise the newcomer is turned away.
// =============================================================================

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

use crate::models::Priority;

/// Ordering key: priority first, then earlier arrivals first (hence Reverse on
/// the sequence number, so the map's last entry is the next to serve).
type Slot = (Priority, Reverse<u64>);

/// Outcome a waiter receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// A token was taken on the waiter's behalf.
    Granted,
    /// Evicted to make room for higher-priority work.
    Shed,
}

/// Opaque handle on a queued waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(Slot);

#[derive(Debug)]
pub enum Enqueued {
    Waiting(Ticket),
    /// Queue full and nothing lower-priority to evict.
    Rejected,
}

/// A waiter's place in line.
#[derive(Debug)]
pub struct Ticket {
    pub slot_id: u64,
    pub priority: Priority,
    pub wakeup: oneshot::Receiver<Wakeup>,
}

#[derive(Debug, Default)]
struct QueueInner {
    waiting: BTreeMap<Slot, oneshot::Sender<Wakeup>>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct PriorityGate {
    capacity: usize,
    inner: Mutex<QueueInner>,
}

impl PriorityGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Join the queue, evicting a lower-priority waiter if it is full.
    pub fn enqueue(&self, priority: Priority) -> Enqueued {
        let mut inner = self.inner.lock();
        inner.waiting.retain(|_, tx| !tx.is_closed());

        if inner.waiting.len() >= self.capacity {
            let lowest = inner.waiting.keys().next().copied();
            match lowest {
                Some(slot) if slot.0 < priority => {
                    if let Some(tx) = inner.waiting.remove(&slot) {
                        let _ = tx.send(Wakeup::Shed);
                    }
                }
                _ => return Enqueued::Rejected,
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        inner.waiting.insert((priority, Reverse(seq)), tx);
        Enqueued::Waiting(Ticket {
            slot_id: seq,
            priority,
            wakeup: rx,
        })
    }

    /// The slot that the next available token belongs to.
    pub fn next_in_line(&self) -> Option<SlotId> {
        self.inner.lock().waiting.keys().next_back().map(|&slot| SlotId(slot))
    }

    /// Hand a token that was taken on behalf of `slot` to its waiter. Returns
    /// false if the waiter already left (withdrawn, shed or cancelled), in
    /// which case the caller still owns the token.
    pub fn grant(&self, slot: SlotId) -> bool {
        let tx = self.inner.lock().waiting.remove(&slot.0);
        match tx {
            Some(tx) => tx.send(Wakeup::Granted).is_ok(),
            None => false,
        }
    }

    /// Leave the queue (timeout or cancellation). Returns false if the waiter
    /// was already woken.
    pub fn withdraw(&self, ticket: &Ticket) -> bool {
        self.inner
            .lock()
            .waiting
            .remove(&(ticket.priority, Reverse(ticket.slot_id)))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
