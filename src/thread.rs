//! Per-thread safepoint state.
//!
//! A [`ThreadSafepoint`] exists for every thread entered in a coordinator. It
//! owns the thread's FIFO queue of pending occurrences, the atomic pending
//! count checked by the poll fast path, the side-effect and action toggles,
//! and the descriptor of the blocking call the thread is currently parked in.
//!
//! Other threads only append to the queue (and interrupt the owner); the owner
//! is the only thread that removes entries, either to perform them or because
//! their handle was cancelled.

use crate::action::{Access, ThreadLocalAction};
use crate::error::{SafepointError, SafepointResult};
use crate::events::SafepointEvent;
use crate::handle::HandleShared;
use crate::interrupt::{InterruptHandle, Interrupted, Interrupter};
use crate::location::Location;
use crate::safepoint::CoordinatorInner;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;

thread_local! {
    static SYNC_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether the calling thread is currently performing a synchronous action.
pub(crate) fn in_synchronous_action() -> bool {
    SYNC_DEPTH.with(|depth| depth.get() > 0)
}

struct SyncDepthGuard;

impl SyncDepthGuard {
    fn enter() -> Self {
        SYNC_DEPTH.with(|depth| depth.set(depth.get() + 1));
        SyncDepthGuard
    }
}

impl Drop for SyncDepthGuard {
    fn drop(&mut self) {
        SYNC_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Marks the occurrence done even if `perform` unwinds.
struct CompletionGuard<'a> {
    handle: &'a HandleShared,
    thread: ThreadId,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        self.handle.finish(self.thread);
    }
}

/// Branch hint for the poll fast path.
#[inline(always)]
fn unlikely(condition: bool) -> bool {
    #[cold]
    fn cold() {}
    if condition {
        cold()
    }
    condition
}

struct QueuedOccurrence {
    seq: u64,
    action: ThreadLocalAction,
    handle: Arc<HandleShared>,
    /// Re-enqueued by a recurring action rather than submitted.
    rearmed: bool,
    /// `notify_blocked` was delivered and `notify_unblocked` is owed.
    blocked_notified: bool,
}

#[derive(Default)]
struct ActionQueue {
    entries: VecDeque<QueuedOccurrence>,
    next_seq: u64,
    disposed: bool,
}

enum Next {
    Perform(QueuedOccurrence),
    Cancelled(QueuedOccurrence),
}

struct BlockedDescriptor {
    interrupter: Arc<dyn Interrupter>,
    location: Location,
}

/// Safepoint state of one entered thread.
///
/// Obtained through [`Access::thread`] or
/// [`LocalSafepoint::thread`](crate::safepoint::LocalSafepoint::thread).
pub struct ThreadSafepoint {
    id: ThreadId,
    name: Option<String>,
    interrupt: InterruptHandle,
    coordinator: Arc<CoordinatorInner>,
    pending: CachePadded<AtomicUsize>,
    queue: Mutex<ActionQueue>,
    side_effects_allowed: AtomicBool,
    actions_allowed: AtomicBool,
    blocked: Mutex<Option<BlockedDescriptor>>,
    /// Interrupters invoked outside `blocked` that have not returned yet.
    interrupts_in_flight: AtomicUsize,
    entered: AtomicUsize,
}

impl ThreadSafepoint {
    /// State for the calling thread.
    pub(crate) fn new(coordinator: Arc<CoordinatorInner>) -> Self {
        let current = std::thread::current();
        Self {
            id: current.id(),
            name: current.name().map(str::to_owned),
            interrupt: InterruptHandle::current(),
            coordinator,
            pending: CachePadded::new(AtomicUsize::new(0)),
            queue: Mutex::new(ActionQueue::default()),
            side_effects_allowed: AtomicBool::new(true),
            actions_allowed: AtomicBool::new(true),
            blocked: Mutex::new(None),
            interrupts_in_flight: AtomicUsize::new(0),
            entered: AtomicUsize::new(0),
        }
    }

    /// Id of the owning thread.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Name of the owning thread, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Handle interrupting the owning thread.
    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    /// Number of queued occurrences, including cancelled ones not yet skipped.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether side-effecting actions currently drain.
    pub fn is_side_effects_allowed(&self) -> bool {
        self.side_effects_allowed.load(Ordering::Acquire)
    }

    /// Whether any actions currently drain.
    pub fn is_actions_allowed(&self) -> bool {
        self.actions_allowed.load(Ordering::Acquire)
    }

    /// Location of the blocking call the thread is parked in, if any.
    pub fn blocked_location(&self) -> Option<Location> {
        self.blocked
            .lock()
            .as_ref()
            .map(|descriptor| descriptor.location.clone())
    }

    /// Whether the thread is inside a wrapped blocking call.
    pub fn is_blocked(&self) -> bool {
        self.blocked.lock().is_some()
    }

    pub(crate) fn coordinator(&self) -> &Arc<CoordinatorInner> {
        &self.coordinator
    }

    pub(crate) fn enter(&self) {
        self.entered.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when the last entry was exited.
    pub(crate) fn exit(&self) -> bool {
        self.entered.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Fast path of a poll: whether the slow path must run.
    #[inline(always)]
    pub(crate) fn should_process(&self) -> bool {
        let coordinator = &self.coordinator;
        if coordinator.count_polls() {
            coordinator.stats.record_polls(1);
        }
        unlikely(self.pending.load(Ordering::Acquire) != 0 || coordinator.safepoint_a_lot())
    }

    pub(crate) fn set_allow_side_effects(&self, enabled: bool) -> bool {
        self.side_effects_allowed.swap(enabled, Ordering::AcqRel)
    }

    pub(crate) fn set_allow_actions(&self, enabled: bool) -> bool {
        self.actions_allowed.swap(enabled, Ordering::AcqRel)
    }

    /// True while side effects are disallowed and a side-effecting occurrence waits.
    pub(crate) fn has_pending_side_effecting_actions(&self) -> bool {
        if self.is_side_effects_allowed() {
            return false;
        }
        self.queue.lock().entries.iter().any(|entry| {
            entry.action.is_side_effecting() && !entry.handle.is_cancelled()
        })
    }

    fn push(&self, queue: &mut ActionQueue, action: ThreadLocalAction, handle: Arc<HandleShared>, rearmed: bool) {
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push_back(QueuedOccurrence {
            seq,
            action,
            handle,
            rearmed,
            blocked_notified: false,
        });
        self.pending.fetch_add(1, Ordering::Release);
    }

    /// Append a submitted occurrence. Returns false if the thread was disposed.
    pub(crate) fn enqueue(&self, action: &ThreadLocalAction, handle: &Arc<HandleShared>) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.disposed {
                return false;
            }
            self.push(&mut queue, action.clone(), Arc::clone(handle), false);
        }
        self.interrupt_if_blocked();
        true
    }

    fn interrupt_if_blocked(&self) {
        let (interrupter, location) = {
            let blocked = self.blocked.lock();
            let Some(descriptor) = blocked.as_ref() else {
                return;
            };
            self.interrupts_in_flight.fetch_add(1, Ordering::AcqRel);
            (Arc::clone(&descriptor.interrupter), descriptor.location.clone())
        };
        {
            let _in_flight = InFlightInterrupt(&self.interrupts_in_flight);
            interrupter.interrupt(&self.interrupt);
        }

        tracing::trace!(thread = ?self.id, %location, "interrupted blocked thread");
        self.coordinator.stats.record_interrupts(1);
        self.coordinator.events.emit(|| SafepointEvent::Interrupted {
            thread: self.id,
            location,
        });
    }

    fn is_drainable(&self, entry: &QueuedOccurrence) -> bool {
        entry.handle.is_cancelled() || !entry.action.is_side_effecting() || self.is_side_effects_allowed()
    }

    /// Remove the first due entry submitted before `limit`.
    ///
    /// A withheld synchronous entry holds back every later synchronous entry.
    fn take_next(&self, limit: u64) -> Option<Next> {
        let mut queue = self.queue.lock();
        let mut withheld_synchronous = false;
        let index = queue
            .entries
            .iter()
            .take_while(|entry| entry.seq < limit)
            .position(|entry| {
                let synchronous = entry.action.is_synchronous();
                if !self.is_drainable(entry) {
                    withheld_synchronous |= synchronous;
                    return false;
                }
                !(withheld_synchronous && synchronous && !entry.handle.is_cancelled())
            })?;
        let entry = queue.entries.remove(index)?;
        self.pending.fetch_sub(1, Ordering::Release);
        drop(queue);

        if entry.handle.is_cancelled() {
            Some(Next::Cancelled(entry))
        } else {
            Some(Next::Perform(entry))
        }
    }

    /// Slow path of a poll: drain every occurrence due at entry, in FIFO order.
    ///
    /// Occurrences re-enqueued by recurring actions during this call wait for
    /// the next poll. An error from `perform` aborts the drain; the remaining
    /// occurrences stay queued.
    pub(crate) fn process(&self, location: &Location) -> SafepointResult<()> {
        self.coordinator.stats.record_hits(1);
        if !self.is_actions_allowed() {
            return Ok(());
        }

        let limit = self.queue.lock().next_seq;
        while let Some(next) = self.take_next(limit) {
            match next {
                Next::Cancelled(entry) => self.skip_cancelled(entry, location),
                Next::Perform(entry) => self.perform(entry, location)?,
            }
        }
        Ok(())
    }

    fn skip_cancelled(&self, entry: QueuedOccurrence, location: &Location) {
        if entry.blocked_notified {
            entry
                .action
                .notify_unblocked(&Access::new(self, location, &entry.action));
        }
        entry.handle.cancel_target(self.id);
        self.record_cancelled(&entry.handle);
    }

    fn record_cancelled(&self, handle: &HandleShared) {
        tracing::trace!(thread = ?self.id, handle = handle.id(), "skipped cancelled occurrence");
        self.coordinator.stats.record_cancelled(1);
        self.coordinator.events.emit(|| SafepointEvent::Cancelled {
            handle: handle.id(),
            thread: self.id,
        });
    }

    fn perform(&self, entry: QueuedOccurrence, location: &Location) -> SafepointResult<()> {
        let QueuedOccurrence {
            action,
            handle,
            blocked_notified,
            ..
        } = entry;
        let access = Access::new(self, location, &action);
        if blocked_notified {
            action.notify_unblocked(&access);
        }

        let synchronous = action.is_synchronous();
        let _sync_depth = synchronous.then(SyncDepthGuard::enter);
        if synchronous && !handle.arrive_and_wait(self.id) {
            handle.cancel_target(self.id);
            self.record_cancelled(&handle);
            return Ok(());
        }
        if !handle.begin(self.id) {
            self.record_cancelled(&handle);
            return Ok(());
        }

        let result = {
            let _completion = CompletionGuard {
                handle: &handle,
                thread: self.id,
            };
            action.perform(&access)
        };
        if synchronous {
            handle.wait_settled();
        }

        self.coordinator.stats.record_performed(1);
        self.coordinator.events.emit(|| SafepointEvent::Performed {
            handle: handle.id(),
            thread: self.id,
        });

        let side_effecting = action.is_side_effecting();
        if action.is_recurring() && !handle.is_cancelled() {
            self.rearm(action, handle);
        }

        result.map_err(|error| {
            let error = SafepointError::from_action(error, side_effecting);
            tracing::warn!(thread = ?self.id, %location, %error, "thread local action failed");
            error
        })
    }

    fn rearm(&self, action: ThreadLocalAction, handle: Arc<HandleShared>) {
        let mut queue = self.queue.lock();
        if queue.disposed {
            drop(queue);
            handle.retire_target(self.id);
            return;
        }
        handle.requeue(self.id);
        self.push(&mut queue, action, handle, true);
    }

    /// Run `blocking` with this thread registered as blocked.
    ///
    /// Pending work that can be drained right away is performed before
    /// blocking. Every interrupt resets the interrupter, drains the queue
    /// between the two hooks, and re-enters `blocking`. Each queued
    /// occurrence receives at most one `notify_blocked` per call and the
    /// matching `notify_unblocked` exactly once.
    pub(crate) fn set_blocked<T, R, F>(
        &self,
        location: &Location,
        interrupter: Arc<dyn Interrupter>,
        mut blocking: F,
        arg: &mut T,
        mut before_interrupt: Option<&mut dyn FnMut(&mut T)>,
        mut after_interrupt: Option<&mut dyn FnMut(&mut T)>,
    ) -> SafepointResult<R>
    where
        F: FnMut(&mut T) -> Result<R, Interrupted>,
    {
        let scope = BlockedScope::enter(self, Arc::clone(&interrupter), location.clone());
        self.coordinator.stats.record_blocked(1);

        if self.has_fresh_drainable() {
            self.process(location)?;
        }
        let entry_seq = self.queue.lock().next_seq;
        self.notify_blocked_pending(location, entry_seq);

        let result = loop {
            match blocking(arg) {
                Ok(value) => break Ok(value),
                Err(Interrupted) => {
                    interrupter.reset_interrupted();
                    tracing::trace!(thread = ?self.id, %location, "blocked call interrupted");
                    if let Some(hook) = before_interrupt.as_deref_mut() {
                        hook(arg);
                    }
                    let drained = self.process(location);
                    if let Some(hook) = after_interrupt.as_deref_mut() {
                        hook(arg);
                    }
                    if let Err(error) = drained {
                        break Err(error);
                    }
                    self.notify_blocked_pending(location, entry_seq);
                }
            }
        };

        drop(scope);
        self.notify_unblocked_owed(location);
        result
    }

    fn has_fresh_drainable(&self) -> bool {
        if !self.is_actions_allowed() {
            return false;
        }
        self.queue
            .lock()
            .entries
            .iter()
            .any(|entry| !entry.rearmed && self.is_drainable(entry))
    }

    /// Deliver `notify_blocked` to pending occurrences not yet notified.
    ///
    /// Occurrences re-armed by a recurring action before `entry_seq` are
    /// left alone.
    fn notify_blocked_pending(&self, location: &Location, entry_seq: u64) {
        let notify: Vec<ThreadLocalAction> = self
            .queue
            .lock()
            .entries
            .iter_mut()
            .filter(|entry| {
                !entry.blocked_notified
                    && !(entry.rearmed && entry.seq < entry_seq)
                    && !entry.handle.is_cancelled()
            })
            .map(|entry| {
                entry.blocked_notified = true;
                entry.action.clone()
            })
            .collect();

        for action in &notify {
            action.notify_blocked(&Access::new(self, location, action));
        }
    }

    fn notify_unblocked_owed(&self, location: &Location) {
        let owed: Vec<ThreadLocalAction> = self
            .queue
            .lock()
            .entries
            .iter_mut()
            .filter(|entry| entry.blocked_notified)
            .map(|entry| {
                entry.blocked_notified = false;
                entry.action.clone()
            })
            .collect();

        for action in &owed {
            action.notify_unblocked(&Access::new(self, location, action));
        }
    }

    /// Cancel every queued handle; the owner skips them at its next poll.
    ///
    /// Returns the number of handles this call cancelled.
    pub(crate) fn cancel_queued(&self) -> usize {
        let handles: Vec<Arc<HandleShared>> = self
            .queue
            .lock()
            .entries
            .iter()
            .map(|entry| Arc::clone(&entry.handle))
            .collect();
        handles.iter().filter(|handle| handle.cancel()).count()
    }

    /// Dispose the queue. Later submissions to this thread are dropped.
    pub(crate) fn retire(&self) {
        let flushed = {
            let mut queue = self.queue.lock();
            queue.disposed = true;
            self.pending.store(0, Ordering::Release);
            std::mem::take(&mut queue.entries)
        };

        let dropped = flushed.len();
        for entry in flushed {
            entry.handle.retire_target(self.id);
        }

        self.coordinator.registry.unregister(self);
        self.coordinator.stats.record_dropped(dropped as u64);
        tracing::debug!(thread = ?self.id, dropped, "thread retired from safepoint coordinator");
        self.coordinator.events.emit(|| SafepointEvent::ThreadRetired {
            thread: self.id,
            dropped,
        });
    }
}

impl fmt::Debug for ThreadSafepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafepoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pending", &self.pending_count())
            .field("side_effects_allowed", &self.is_side_effects_allowed())
            .field("actions_allowed", &self.is_actions_allowed())
            .finish()
    }
}

/// Releases an in-flight interrupt count, even if the interrupter unwinds.
struct InFlightInterrupt<'a>(&'a AtomicUsize);

impl Drop for InFlightInterrupt<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Installs a blocked descriptor and restores the previous one on drop.
///
/// On drop, interrupts already handed to an interrupter are waited out before
/// the interrupter is reset, so none of them lands after this scope.
struct BlockedScope<'a> {
    thread: &'a ThreadSafepoint,
    previous: Option<BlockedDescriptor>,
}

impl<'a> BlockedScope<'a> {
    fn enter(thread: &'a ThreadSafepoint, interrupter: Arc<dyn Interrupter>, location: Location) -> Self {
        let previous = thread.blocked.lock().replace(BlockedDescriptor {
            interrupter,
            location,
        });
        Self { thread, previous }
    }
}

impl Drop for BlockedScope<'_> {
    fn drop(&mut self) {
        let current = std::mem::replace(&mut *self.thread.blocked.lock(), self.previous.take());
        let backoff = Backoff::new();
        while self.thread.interrupts_in_flight.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
        if let Some(descriptor) = current {
            descriptor.interrupter.reset_interrupted();
        }
    }
}
