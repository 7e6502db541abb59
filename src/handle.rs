//! Completion handles for submitted actions.
//!
//! One handle is shared by every target thread of a submission. It tracks the
//! state of each (action, thread) occurrence, the cancellation flag, and the
//! rendezvous used by synchronous actions.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// State of one occurrence of an action on one target thread.
///
/// `Queued → Running → Done`, or `Queued → Cancelled`. `Dropped` marks targets
/// that retired before performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceState {
    Queued,
    Running,
    Done,
    Cancelled,
    Dropped,
}

/// How a waited-for handle resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug)]
struct TargetProgress {
    state: OccurrenceState,
    performed: u64,
    arrived: bool,
}

impl TargetProgress {
    fn settled(&self, recurring: bool) -> bool {
        match self.state {
            OccurrenceState::Done | OccurrenceState::Cancelled | OccurrenceState::Dropped => true,
            OccurrenceState::Queued | OccurrenceState::Running => recurring && self.performed > 0,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    targets: HashMap<ThreadId, TargetProgress>,
    arrived: usize,
    settled: usize,
    sealed: bool,
    cancelled: bool,
}

impl Progress {
    fn is_done(&self) -> bool {
        self.sealed && (self.cancelled || self.settled == self.targets.len())
    }

    fn all_arrived(&self) -> bool {
        self.sealed && self.arrived == self.targets.len()
    }
}

pub(crate) struct HandleShared {
    id: u64,
    synchronous: bool,
    recurring: bool,
    cancelled: AtomicBool,
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl HandleShared {
    pub(crate) fn new(id: u64, synchronous: bool, recurring: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            synchronous,
            recurring,
            cancelled: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
            changed: Condvar::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Record a target before its occurrence is enqueued.
    pub(crate) fn add_target(&self, thread: ThreadId) {
        self.progress
            .lock()
            .targets
            .entry(thread)
            .or_insert(TargetProgress {
                state: OccurrenceState::Queued,
                performed: 0,
                arrived: false,
            });
    }

    /// All targets have been recorded; the handle may now resolve.
    pub(crate) fn seal(&self) {
        self.progress.lock().sealed = true;
        self.changed.notify_all();
    }

    fn update<F>(&self, thread: ThreadId, f: F)
    where
        F: FnOnce(&mut TargetProgress, &mut bool),
    {
        let mut progress = self.progress.lock();
        let recurring = self.recurring;
        let Progress {
            targets,
            arrived,
            settled,
            ..
        } = &mut *progress;
        if let Some(target) = targets.get_mut(&thread) {
            let was_settled = target.settled(recurring);
            let was_arrived = target.arrived;
            let mut arrive = false;
            f(target, &mut arrive);
            if arrive && !was_arrived {
                target.arrived = true;
                *arrived += 1;
            }
            match (was_settled, target.settled(recurring)) {
                (false, true) => *settled += 1,
                (true, false) => *settled -= 1,
                _ => {}
            }
        }
        drop(progress);
        self.changed.notify_all();
    }

    /// Transition `Queued → Running`. Returns false if the handle was cancelled,
    /// in which case the occurrence is marked cancelled instead.
    pub(crate) fn begin(&self, thread: ThreadId) -> bool {
        let mut started = false;
        self.update(thread, |target, arrive| {
            *arrive = true;
            if self.is_cancelled() {
                if target.state != OccurrenceState::Done {
                    target.state = OccurrenceState::Cancelled;
                }
            } else {
                target.state = OccurrenceState::Running;
                started = true;
            }
        });
        started
    }

    /// Transition `Running → Done`.
    pub(crate) fn finish(&self, thread: ThreadId) {
        self.update(thread, |target, _| {
            target.state = OccurrenceState::Done;
            target.performed += 1;
        });
    }

    /// A recurring action queued its next occurrence on `thread`.
    pub(crate) fn requeue(&self, thread: ThreadId) {
        self.update(thread, |target, _| {
            if target.state == OccurrenceState::Done {
                target.state = OccurrenceState::Queued;
            }
        });
    }

    /// A queued occurrence was skipped because the handle was cancelled.
    pub(crate) fn cancel_target(&self, thread: ThreadId) {
        self.update(thread, |target, arrive| {
            if matches!(target.state, OccurrenceState::Queued) {
                target.state = OccurrenceState::Cancelled;
            }
            *arrive = true;
        });
    }

    /// The target retired (or was already disposed) before performing.
    pub(crate) fn retire_target(&self, thread: ThreadId) {
        self.update(thread, |target, arrive| {
            if matches!(target.state, OccurrenceState::Queued) {
                target.state = OccurrenceState::Dropped;
            }
            *arrive = true;
        });
    }

    pub(crate) fn cancel(&self) -> bool {
        let mut progress = self.progress.lock();
        if progress.cancelled || (progress.is_done() && !self.recurring) {
            return false;
        }
        progress.cancelled = true;
        self.cancelled.store(true, Ordering::Release);
        drop(progress);
        self.changed.notify_all();
        tracing::debug!(handle = self.id, "thread local action cancelled");
        true
    }

    /// Synchronous rendezvous: record arrival and wait until every target has
    /// arrived. Returns false if the handle was cancelled while waiting.
    pub(crate) fn arrive_and_wait(&self, thread: ThreadId) -> bool {
        self.update(thread, |_, arrive| *arrive = true);
        let mut progress = self.progress.lock();
        while !progress.all_arrived() && !progress.cancelled {
            self.changed.wait(&mut progress);
        }
        !progress.cancelled
    }

    /// Synchronous completion: wait until every target is settled or the
    /// handle is cancelled.
    pub(crate) fn wait_settled(&self) {
        let mut progress = self.progress.lock();
        while !progress.is_done() {
            self.changed.wait(&mut progress);
        }
    }

    fn outcome(progress: &MutexGuard<'_, Progress>) -> ActionOutcome {
        if progress.cancelled {
            ActionOutcome::Cancelled
        } else {
            ActionOutcome::Completed
        }
    }
}

/// Handle returned by [`SafepointCoordinator::submit`](crate::safepoint::SafepointCoordinator::submit).
///
/// The handle resolves when every target thread has performed the action (for
/// recurring actions: the first occurrence), retired, or when the handle is
/// cancelled. Waiting on a handle from one of its own target threads without
/// polling deadlocks.
#[derive(Clone)]
pub struct ActionHandle {
    shared: Arc<HandleShared>,
}

impl ActionHandle {
    pub(crate) fn new(shared: Arc<HandleShared>) -> Self {
        Self { shared }
    }

    /// Identifier reported in events and logs.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the submitted action is synchronous.
    pub fn is_synchronous(&self) -> bool {
        self.shared.synchronous
    }

    /// Whether the submitted action is recurring.
    pub fn is_recurring(&self) -> bool {
        self.shared.recurring
    }

    /// Block until the handle resolves.
    pub fn wait(&self) -> ActionOutcome {
        let mut progress = self.shared.progress.lock();
        while !progress.is_done() {
            self.shared.changed.wait(&mut progress);
        }
        HandleShared::outcome(&progress)
    }

    /// Block until the handle resolves or `timeout` elapses.
    ///
    /// Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<ActionOutcome> {
        let deadline = Instant::now() + timeout;
        let mut progress = self.shared.progress.lock();
        while !progress.is_done() {
            if self
                .shared
                .changed
                .wait_until(&mut progress, deadline)
                .timed_out()
            {
                return progress.is_done().then(|| HandleShared::outcome(&progress));
            }
        }
        Some(HandleShared::outcome(&progress))
    }

    /// Cancel every occurrence that has not started yet.
    ///
    /// Occurrences already running complete normally. Recurring actions stop
    /// re-enqueueing once a target observes the cancellation. Returns false if
    /// the handle had already resolved.
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    /// Whether every target has settled or the handle was cancelled.
    pub fn is_done(&self) -> bool {
        self.shared.progress.lock().is_done()
    }

    /// Whether [`cancel`](Self::cancel) took effect.
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Number of threads the action was delivered to.
    pub fn target_count(&self) -> usize {
        self.shared.progress.lock().targets.len()
    }

    /// Number of targets that performed the action at least once.
    pub fn completed_count(&self) -> usize {
        self.shared
            .progress
            .lock()
            .targets
            .values()
            .filter(|target| target.performed > 0)
            .count()
    }

    /// Total number of performances across all targets.
    pub fn performed_count(&self) -> u64 {
        self.shared
            .progress
            .lock()
            .targets
            .values()
            .map(|target| target.performed)
            .sum()
    }

    /// State of the occurrence on `thread`, if it was a target.
    pub fn state_for(&self, thread: ThreadId) -> Option<OccurrenceState> {
        self.shared
            .progress
            .lock()
            .targets
            .get(&thread)
            .map(|target| target.state)
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.shared.progress.lock();
        f.debug_struct("ActionHandle")
            .field("id", &self.shared.id)
            .field("targets", &progress.targets.len())
            .field("settled", &progress.settled)
            .field("cancelled", &progress.cancelled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn other_thread_id() -> ThreadId {
        thread::spawn(|| thread::current().id()).join().unwrap()
    }

    #[test]
    fn empty_submission_resolves_immediately() {
        let shared = HandleShared::new(1, false, false);
        shared.seal();
        let handle = ActionHandle::new(shared);
        assert!(handle.is_done());
        assert_eq!(handle.wait(), ActionOutcome::Completed);
        assert!(!handle.cancel());
    }

    #[test]
    fn unsealed_handle_is_not_done() {
        let shared = HandleShared::new(1, false, false);
        let handle = ActionHandle::new(shared.clone());
        assert!(!handle.is_done());
        assert_eq!(handle.wait_timeout(Duration::from_millis(1)), None);
        shared.seal();
        assert!(handle.is_done());
    }

    #[test]
    fn resolves_after_every_target_finishes() {
        let a = thread::current().id();
        let b = other_thread_id();
        let shared = HandleShared::new(7, false, false);
        shared.add_target(a);
        shared.add_target(b);
        shared.seal();
        let handle = ActionHandle::new(shared.clone());

        assert!(shared.begin(a));
        assert_eq!(handle.state_for(a), Some(OccurrenceState::Running));
        shared.finish(a);
        assert!(!handle.is_done());

        shared.retire_target(b);
        assert_eq!(handle.state_for(b), Some(OccurrenceState::Dropped));
        assert_eq!(handle.wait(), ActionOutcome::Completed);
        assert_eq!(handle.completed_count(), 1);
    }

    #[test]
    fn cancel_prevents_begin() {
        let a = thread::current().id();
        let shared = HandleShared::new(2, false, false);
        shared.add_target(a);
        shared.seal();
        let handle = ActionHandle::new(shared.clone());

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!shared.begin(a));
        assert_eq!(handle.state_for(a), Some(OccurrenceState::Cancelled));
        assert_eq!(handle.wait(), ActionOutcome::Cancelled);
    }

    #[test]
    fn cancel_after_begin_lets_occurrence_finish() {
        let a = thread::current().id();
        let shared = HandleShared::new(3, false, false);
        shared.add_target(a);
        shared.seal();
        let handle = ActionHandle::new(shared.clone());

        assert!(shared.begin(a));
        assert!(handle.cancel());
        shared.finish(a);
        assert_eq!(handle.state_for(a), Some(OccurrenceState::Done));
        assert_eq!(handle.performed_count(), 1);
    }

    #[test]
    fn recurring_resolves_on_first_occurrence_and_stays_cancellable() {
        let a = thread::current().id();
        let shared = HandleShared::new(4, false, true);
        shared.add_target(a);
        shared.seal();
        let handle = ActionHandle::new(shared.clone());

        assert!(shared.begin(a));
        shared.finish(a);
        shared.requeue(a);
        assert_eq!(handle.state_for(a), Some(OccurrenceState::Queued));
        assert_eq!(handle.wait(), ActionOutcome::Completed);

        assert!(handle.cancel());
        assert!(handle.is_cancelled());
        assert!(!shared.begin(a));
    }

    #[test]
    fn synchronous_rendezvous_waits_for_all_targets() {
        let a = thread::current().id();
        let b = other_thread_id();
        let shared = HandleShared::new(5, true, false);
        shared.add_target(a);
        shared.add_target(b);
        shared.seal();

        let remote = shared.clone();
        let arrival = thread::spawn(move || remote.arrive_and_wait(a));
        thread::sleep(Duration::from_millis(10));
        assert!(!arrival.is_finished());

        shared.retire_target(b);
        assert!(arrival.join().unwrap());
    }

    #[test]
    fn cancellation_releases_rendezvous() {
        let a = thread::current().id();
        let b = other_thread_id();
        let shared = HandleShared::new(6, true, false);
        shared.add_target(a);
        shared.add_target(b);
        shared.seal();
        let handle = ActionHandle::new(shared.clone());

        let remote = shared.clone();
        let arrival = thread::spawn(move || remote.arrive_and_wait(a));
        thread::sleep(Duration::from_millis(10));
        assert!(handle.cancel());
        assert!(!arrival.join().unwrap());
    }
}
