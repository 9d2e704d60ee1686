//! Pending-event queues.

use ptkit_packet::Error;

use crate::event::{Event, EventKind};

/// The number of ring buffer slots per binding. One slot stays unused to
/// tell a full queue from an empty one.
const EVB_MAX_PEND: usize = 8;

/// The resolution point an event is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBinding {
    /// The event completes at the end of the PSB+ sequence
    Psbend,
    /// The event completes at the next TIP-class packet
    Tip,
    /// The event completes at the next FUP packet
    Fup,
}

/// A fixed-size FIFO of pending events.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventQueue {
    slots: [Option<Event>; EVB_MAX_PEND],
    begin: usize,
    end: usize,
}

impl EventQueue {
    fn inc(index: usize) -> usize {
        (index + 1) % EVB_MAX_PEND
    }

    /// Append `event`.
    ///
    /// Fails with [`Error::Nomem`] on a full queue; the queued events are
    /// untouched in that case.
    pub fn enqueue(&mut self, event: Event) -> Result<(), Error> {
        let end = Self::inc(self.end);
        if end == self.begin {
            return Err(Error::Nomem);
        }
        self.slots[self.end] = Some(event);
        self.end = end;
        Ok(())
    }

    /// Remove and return the oldest pending event.
    pub fn dequeue(&mut self) -> Option<Event> {
        if self.begin == self.end {
            return None;
        }
        let event = self.slots[self.begin].take();
        self.begin = Self::inc(self.begin);
        debug_assert!(event.is_some(), "pending slots are always occupied");
        event
    }

    /// Drop all pending events.
    pub fn discard_all(&mut self) {
        *self = EventQueue::default();
    }

    /// Whether any event is pending.
    #[must_use]
    pub fn any_pending(&self) -> bool {
        self.begin != self.end
    }

    /// The oldest pending event matching `matches`, if any.
    pub fn find_by_kind(&self, matches: impl Fn(&EventKind) -> bool) -> Option<&Event> {
        let mut index = self.begin;
        while index != self.end {
            if let Some(event) = self.slots[index].as_ref() {
                if matches(&event.kind) {
                    return Some(event);
                }
            }
            index = Self::inc(index);
        }
        None
    }
}

/// The pending-event queues of a query decoder, one per binding.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventQueues {
    psbend: EventQueue,
    tip: EventQueue,
    fup: EventQueue,
}

impl EventQueues {
    /// The queue for `binding`.
    pub fn get_mut(&mut self, binding: EventBinding) -> &mut EventQueue {
        match binding {
            EventBinding::Psbend => &mut self.psbend,
            EventBinding::Tip => &mut self.tip,
            EventBinding::Fup => &mut self.fup,
        }
    }

    /// The queue for `binding`.
    #[must_use]
    pub fn get(&self, binding: EventBinding) -> &EventQueue {
        match binding {
            EventBinding::Psbend => &self.psbend,
            EventBinding::Tip => &self.tip,
            EventBinding::Fup => &self.fup,
        }
    }

    /// Drop every pending event in every binding.
    pub fn discard_all(&mut self) {
        self.psbend.discard_all();
        self.tip.discard_all();
        self.fup.discard_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paging(cr3: u64) -> Event {
        Event::new(EventKind::Paging { cr3 })
    }

    #[test]
    fn fifo_order() {
        let mut queue = EventQueue::default();
        queue.enqueue(paging(1)).unwrap();
        queue.enqueue(paging(2)).unwrap();
        assert_eq!(queue.dequeue(), Some(paging(1)));
        assert_eq!(queue.dequeue(), Some(paging(2)));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn a_full_queue_rejects_without_corruption() {
        let mut queue = EventQueue::default();
        for cr3 in 0..EVB_MAX_PEND as u64 - 1 {
            queue.enqueue(paging(cr3)).unwrap();
        }
        assert_eq!(queue.enqueue(paging(99)), Err(Error::Nomem));

        for cr3 in 0..EVB_MAX_PEND as u64 - 1 {
            assert_eq!(queue.dequeue(), Some(paging(cr3)));
        }
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn wraps_around_the_reserved_slot() {
        let mut queue = EventQueue::default();
        for round in 0..3 * EVB_MAX_PEND as u64 {
            queue.enqueue(paging(round)).unwrap();
            assert_eq!(queue.dequeue(), Some(paging(round)));
        }
        assert!(!queue.any_pending());
    }

    #[test]
    fn find_by_kind_scans_pending_events() {
        let mut queue = EventQueue::default();
        queue.enqueue(paging(1)).unwrap();
        queue
            .enqueue(Event::new(EventKind::Overflow { ip: 0x40 }))
            .unwrap();

        assert!(queue
            .find_by_kind(|kind| matches!(kind, EventKind::Overflow { .. }))
            .is_some());
        assert!(queue
            .find_by_kind(|kind| matches!(kind, EventKind::Enabled { .. }))
            .is_none());

        queue.dequeue();
        queue.dequeue();
        assert!(queue
            .find_by_kind(|kind| matches!(kind, EventKind::Overflow { .. }))
            .is_none());
    }

    #[test]
    fn discard_empties_the_queue() {
        let mut queue = EventQueue::default();
        queue.enqueue(paging(1)).unwrap();
        queue.discard_all();
        assert!(!queue.any_pending());
        assert_eq!(queue.dequeue(), None);
    }
}
