//! Observer events published by a coordinator.

use crate::location::Location;
use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;

/// Notification about coordinator activity.
///
/// Events are delivered on a best-effort basis: a subscriber whose channel is
/// full misses events instead of stalling the emitting thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafepointEvent {
    ThreadEntered { thread: ThreadId },
    /// `dropped` occurrences were still queued when the thread retired.
    ThreadRetired { thread: ThreadId, dropped: usize },
    Submitted { handle: u64, targets: usize },
    Performed { handle: u64, thread: ThreadId },
    Cancelled { handle: u64, thread: ThreadId },
    /// A blocked thread was interrupted at `location` to process new work.
    Interrupted { thread: ThreadId, location: Location },
}

#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<Sender<SafepointEvent>>>,
    active: AtomicBool,
}

impl EventBus {
    pub(crate) fn subscribe(&self, capacity: usize) -> Receiver<SafepointEvent> {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        self.subscribers.lock().push(sender);
        self.active.store(true, Ordering::Release);
        receiver
    }

    /// Publish the event built by `event`; the closure only runs when someone listens.
    pub(crate) fn emit<F>(&self, event: F)
    where
        F: FnOnce() -> SafepointEvent,
    {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        let event = event();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        self.active.store(!subscribers.is_empty(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn events_reach_every_subscriber() {
        let bus = EventBus::default();
        let first = bus.subscribe(4);
        let second = bus.subscribe(4);
        let thread = thread::current().id();

        bus.emit(|| SafepointEvent::ThreadEntered { thread });

        assert_eq!(first.try_recv(), Ok(SafepointEvent::ThreadEntered { thread }));
        assert_eq!(second.try_recv(), Ok(SafepointEvent::ThreadEntered { thread }));
    }

    #[test]
    fn no_subscribers_skips_event_construction() {
        let bus = EventBus::default();
        bus.emit(|| panic!("event built without subscribers"));
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let bus = EventBus::default();
        drop(bus.subscribe(1));
        bus.emit(|| SafepointEvent::Submitted { handle: 1, targets: 0 });
        assert!(!bus.active.load(Ordering::Acquire));
    }

    #[test]
    fn full_subscriber_misses_events() {
        let bus = EventBus::default();
        let receiver = bus.subscribe(1);
        bus.emit(|| SafepointEvent::Submitted { handle: 1, targets: 1 });
        bus.emit(|| SafepointEvent::Submitted { handle: 2, targets: 1 });

        assert_eq!(receiver.len(), 1);
        assert_eq!(
            receiver.try_recv(),
            Ok(SafepointEvent::Submitted { handle: 1, targets: 1 })
        );
    }
}
