//! Full and counting events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use ptl4_wire::NiFail;

use crate::ProcessId;

/// Kind of a full event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A get operation completed at the target.
    Get,
    /// A put operation completed at the target.
    Put,
    /// An atomic, fetch-atomic or swap operation completed at the target.
    Atomic,
    /// A buffered put was claimed by a later append or search.
    PutOverflow,
    /// A buffered get was claimed by a later append or search.
    GetOverflow,
    /// A buffered atomic was claimed by a later append or search.
    AtomicOverflow,
    /// A buffered fetch-atomic or swap was claimed by a later append or
    /// search.
    FetchAtomicOverflow,
    /// A search completed.
    Search,
    /// A flow-controlled table entry finished disabling itself.
    PtDisabled,
    /// An element was automatically unlinked.
    AutoUnlink,
    /// The request left the initiator.
    Send,
    /// An acknowledgement arrived at the initiator.
    Ack,
    /// A reply arrived at the initiator.
    Reply,
}

/// A full event delivered to an event queue.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Delivery status of the operation.
    pub ni_fail: NiFail,
    /// Identity of the initiator.
    pub initiator: ProcessId,
    /// Match bits of the request.
    pub match_bits: u64,
    /// Out-of-band data from the request header.
    pub hdr_data: u64,
    /// Manipulated length in bytes.
    pub mlength: u64,
    /// Manipulated offset into the element.
    pub moffset: u64,
    /// Offset requested by the initiator.
    pub remote_offset: u64,
    /// Snapshot of the address of the first manipulated byte, when one
    /// exists.
    pub start: Option<usize>,
    /// User pointer of the element or operation the event refers to.
    pub user_ptr: u64,
    /// Table entry the event belongs to.
    pub pt_index: u32,
    /// User id of the initiator.
    pub uid: u32,
}

/// A bounded multi-producer queue of full events.
///
/// Producers are the progress, application and completion threads; the
/// consumer is whoever polls. When the queue is full further events are
/// dropped and the loss is latched in a flag the consumer can observe.
#[derive(Debug)]
pub struct EventQueue {
    queue: ArrayQueue<Event>,
    dropped: AtomicBool,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            dropped: AtomicBool::new(false),
        }
    }

    /// Append an event, latching the dropped flag when the queue is full.
    pub fn push(&self, event: Event) {
        if self.queue.push(event).is_err() {
            self.dropped.store(true, Ordering::Release);
        }
    }

    /// Take the oldest event, if any.
    pub fn pop(&self) -> Option<Event> {
        self.queue.pop()
    }

    /// Whether events have been lost since the last call; clears the flag.
    pub fn take_dropped(&self) -> bool {
        self.dropped.swap(false, Ordering::AcqRel)
    }

    /// Number of events currently queued.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Snapshot of a counting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtValue {
    /// Completed operations or bytes, depending on the counting mode of the
    /// object the counter is attached to.
    pub success: u64,
    /// Failed operations.
    pub failure: u64,
}

/// A counting event: two counters updated without ordering obligations.
#[derive(Debug, Default)]
pub struct Ct {
    success: AtomicU64,
    failure: AtomicU64,
}

impl Ct {
    /// Create a counter pair at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completion: `amount` on success, one failure otherwise.
    pub fn add(&self, ni_fail: NiFail, amount: u64) {
        if ni_fail.is_ok() {
            self.success.fetch_add(amount, Ordering::AcqRel);
        } else {
            self.failure.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Read both counters.
    pub fn get(&self) -> CtValue {
        CtValue {
            success: self.success.load(Ordering::Acquire),
            failure: self.failure.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy(kind: EventKind) -> Event {
        Event {
            kind,
            ni_fail: NiFail::Ok,
            initiator: ProcessId::new(0, 0),
            match_bits: 0,
            hdr_data: 0,
            mlength: 0,
            moffset: 0,
            remote_offset: 0,
            start: None,
            user_ptr: 0,
            pt_index: 0,
            uid: 0,
        }
    }

    #[test]
    fn queue_is_fifo() {
        let eq = EventQueue::new(4);
        eq.push(dummy(EventKind::Put));
        eq.push(dummy(EventKind::Ack));
        assert_eq!(eq.pop().unwrap().kind, EventKind::Put);
        assert_eq!(eq.pop().unwrap().kind, EventKind::Ack);
        assert!(eq.pop().is_none());
    }

    #[test]
    fn overflow_latches_dropped() {
        let eq = EventQueue::new(2);
        for _ in 0..3 {
            eq.push(dummy(EventKind::Put));
        }
        assert_eq!(eq.len(), 2);
        assert!(eq.take_dropped());
        assert!(!eq.take_dropped());
    }

    #[test]
    fn counters_split_by_status() {
        let ct = Ct::new();
        ct.add(NiFail::Ok, 16);
        ct.add(NiFail::Ok, 1);
        ct.add(NiFail::Dropped, 16);
        assert_eq!(
            ct.get(),
            CtValue {
                success: 17,
                failure: 1
            }
        );
    }
}
