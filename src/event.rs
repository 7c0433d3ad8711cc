//! Deferred-work events
//!
//! The interrupt context never performs operations with unbounded
//! latency. Anything needing millisecond-scale delays or calls into
//! sleeping collaborators is described by a [`DeferredEvent`] and
//! pushed onto a bounded queue, which the deferred context drains in
//! [`Driver::run_deferred`](crate::Driver::run_deferred).

use heapless::Deque;

use crate::classifier::TimerToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeferredEvent {
    /// Arm the classifier's protocol-activity timer.
    ArmClassifierTimer(TimerToken),
    /// Cancel an armed classifier timer.
    CancelClassifierTimer(TimerToken),
    /// Pass a new current limit to the charging collaborator.
    SetCurrentLimit(u16),
    /// The classifier decided the peer is a dedicated charger.
    ChargerPresent,
    /// The cable is gone.
    PeerDisconnected,
    /// The bus suspended; run low-power entry and notify the function.
    Suspended,
    /// The bus resumed.
    Resumed,
}

const CAPACITY: usize = 16;

/// Bounded event channel between interrupt and deferred contexts.
pub(crate) struct EventQueue {
    events: Deque<DeferredEvent, CAPACITY>,
}

impl EventQueue {
    pub const fn new() -> Self {
        EventQueue {
            events: Deque::new(),
        }
    }

    /// Enqueue an event. A full queue drops the event with a warning;
    /// sizing the queue for the worst-case burst is the driver's job.
    pub fn push(&mut self, event: DeferredEvent) {
        if self.events.push_back(event).is_err() {
            warn!("deferred event queue overflow");
        }
    }

    pub fn pop(&mut self) -> Option<DeferredEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::{DeferredEvent, EventQueue};

    #[test]
    fn fifo_order() {
        let mut queue = EventQueue::new();
        queue.push(DeferredEvent::Suspended);
        queue.push(DeferredEvent::Resumed);
        assert_eq!(queue.pop(), Some(DeferredEvent::Suspended));
        assert_eq!(queue.pop(), Some(DeferredEvent::Resumed));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn overflow_drops_newest() {
        let mut queue = EventQueue::new();
        for _ in 0..64 {
            queue.push(DeferredEvent::ChargerPresent);
        }
        let mut drained = 0;
        while queue.pop().is_some() {
            drained += 1;
        }
        assert_eq!(drained, super::CAPACITY);
    }
}
