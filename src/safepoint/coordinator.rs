//! Coordinator: thread registry, submission fan-out and shutdown.

use crate::action::ThreadLocalAction;
use crate::config::SafepointConfig;
use crate::error::{SafepointError, SafepointResult};
use crate::events::{EventBus, SafepointEvent};
use crate::handle::{ActionHandle, HandleShared};
use crate::registry::ThreadRegistry;
use crate::stats::{SafepointCounters, SafepointStats};
use crate::thread::{self, ThreadSafepoint};
use arc_swap::ArcSwap;
use flume::Receiver;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;

use super::local::LocalSafepoint;

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by a coordinator and every thread entered in it.
pub(crate) struct CoordinatorInner {
    id: u64,
    pub(crate) registry: ThreadRegistry,
    pub(crate) stats: SafepointCounters,
    pub(crate) events: EventBus,
    config: ArcSwap<SafepointConfig>,
    // Mirrors of the config flags read on the poll fast path.
    safepoint_a_lot: AtomicBool,
    collect_stats: AtomicBool,
    closed: AtomicBool,
    next_handle: AtomicU64,
    // Held across a synchronous fan-out so every target queues synchronous
    // actions in the same order.
    synchronous_order: Mutex<()>,
}

impl CoordinatorInner {
    fn new(config: SafepointConfig) -> Self {
        Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            registry: ThreadRegistry::new(),
            stats: SafepointCounters::default(),
            events: EventBus::default(),
            safepoint_a_lot: AtomicBool::new(config.safepoint_a_lot),
            collect_stats: AtomicBool::new(config.collect_stats),
            config: ArcSwap::from_pointee(config),
            closed: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            synchronous_order: Mutex::new(()),
        }
    }

    #[inline(always)]
    pub(crate) fn safepoint_a_lot(&self) -> bool {
        self.safepoint_a_lot.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub(crate) fn count_polls(&self) -> bool {
        self.collect_stats.load(Ordering::Relaxed)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Coordinates thread-local actions among the threads entered in it.
///
/// A coordinator is an owned registry tied to an execution context; several
/// independent coordinators may coexist. Cloning is cheap and shares the
/// coordinator.
///
/// # Examples
///
/// ```
/// use thread_safepoint::action::ThreadLocalAction;
/// use thread_safepoint::handle::ActionOutcome;
/// use thread_safepoint::location::Location;
/// use thread_safepoint::safepoint::SafepointCoordinator;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let coordinator = SafepointCoordinator::new();
/// let local = coordinator.enter_thread().unwrap();
///
/// let runs = Arc::new(AtomicUsize::new(0));
/// let counter = runs.clone();
/// let action = ThreadLocalAction::new(false, false, move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
///     Ok(())
/// });
///
/// let handle = coordinator.submit_to(local.id(), &action).unwrap();
/// local.poll(&Location::new("loop")).unwrap();
///
/// assert_eq!(handle.wait(), ActionOutcome::Completed);
/// assert_eq!(runs.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct SafepointCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SafepointCoordinator {
    /// Coordinator with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SafepointConfig::default())
    }

    pub fn with_config(config: SafepointConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner::new(config)),
        }
    }

    /// Coordinator configured from the `SAFEPOINT_*` environment variables.
    pub fn from_env() -> Self {
        Self::with_config(SafepointConfig::from_env())
    }

    pub(crate) fn from_inner(inner: Arc<CoordinatorInner>) -> Self {
        Self { inner }
    }

    /// Process-unique coordinator id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Enter the calling thread, making it eligible to receive actions.
    ///
    /// Entering is reentrant: a thread already entered in this coordinator
    /// gets another scope on the same state. The thread retires when its
    /// last [`LocalSafepoint`] is dropped.
    ///
    /// # Errors
    ///
    /// [`SafepointError::Closed`] after [`close`](Self::close).
    pub fn enter_thread(&self) -> SafepointResult<LocalSafepoint> {
        if self.inner.is_closed() {
            return Err(SafepointError::Closed);
        }

        let id = std::thread::current().id();
        let state = match self.inner.registry.get(id) {
            Some(state) => state,
            None => {
                let state = Arc::new(ThreadSafepoint::new(Arc::clone(&self.inner)));
                self.inner.registry.register(&state);
                tracing::debug!(
                    coordinator = self.inner.id,
                    thread = ?id,
                    name = state.name(),
                    "thread entered safepoint coordinator"
                );
                self.inner
                    .events
                    .emit(|| SafepointEvent::ThreadEntered { thread: id });
                state
            }
        };

        Ok(LocalSafepoint::enter(state))
    }

    /// Submit `action` to `threads`, or to every entered thread when `None`.
    ///
    /// The action is appended to each target's queue and blocked targets are
    /// interrupted. Unknown or retired targets are skipped. The returned
    /// handle is shared by all targets; this call never waits for it.
    ///
    /// Synchronous actions from concurrent submitters are queued in one
    /// order on every target, so their rendezvous cannot wait on each other.
    ///
    /// # Errors
    ///
    /// - [`SafepointError::Closed`] after [`close`](Self::close).
    /// - [`SafepointError::RecursiveSynchronous`] when a synchronous action is
    ///   submitted from inside a synchronous action's `perform`.
    pub fn submit(
        &self,
        threads: Option<&[ThreadId]>,
        action: &ThreadLocalAction,
    ) -> SafepointResult<ActionHandle> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SafepointError::Closed);
        }
        if action.is_synchronous() && thread::in_synchronous_action() {
            return Err(SafepointError::RecursiveSynchronous);
        }

        let targets = match threads {
            None => inner.registry.live(),
            Some(ids) => {
                let mut seen = HashSet::with_capacity(ids.len());
                ids.iter()
                    .filter(|id| seen.insert(**id))
                    .filter_map(|id| {
                        let target = inner.registry.get(*id);
                        if target.is_none() {
                            tracing::debug!(thread = ?id, "skipping submission to unknown thread");
                        }
                        target
                    })
                    .collect()
            }
        };

        let shared = HandleShared::new(
            inner.next_handle.fetch_add(1, Ordering::Relaxed),
            action.is_synchronous(),
            action.is_recurring(),
        );
        let mut delivered = 0usize;
        let ordered = action
            .is_synchronous()
            .then(|| inner.synchronous_order.lock());
        for target in &targets {
            shared.add_target(target.id());
            if target.enqueue(action, &shared) {
                delivered += 1;
            } else {
                tracing::debug!(thread = ?target.id(), "dropped submission to disposed thread");
                shared.retire_target(target.id());
                inner.stats.record_dropped(1);
            }
        }
        drop(ordered);
        shared.seal();

        inner.stats.record_submitted(delivered as u64);
        tracing::trace!(
            handle = shared.id(),
            action = action.name(),
            targets = delivered,
            "submitted thread local action"
        );
        inner.events.emit(|| SafepointEvent::Submitted {
            handle: shared.id(),
            targets: delivered,
        });

        Ok(ActionHandle::new(shared))
    }

    /// Submit `action` to a single thread.
    pub fn submit_to(
        &self,
        thread: ThreadId,
        action: &ThreadLocalAction,
    ) -> SafepointResult<ActionHandle> {
        self.submit(Some(std::slice::from_ref(&thread)), action)
    }

    /// Submit `action` to every entered thread.
    pub fn submit_all(&self, action: &ThreadLocalAction) -> SafepointResult<ActionHandle> {
        self.submit(None, action)
    }

    /// Stop accepting submissions and entries, and cancel every queued occurrence.
    ///
    /// Entered threads keep working; their cancelled occurrences are skipped
    /// at their next poll.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled: usize = self
            .inner
            .registry
            .live()
            .iter()
            .map(|thread| thread.cancel_queued())
            .sum();
        tracing::debug!(coordinator = self.inner.id, cancelled, "safepoint coordinator closed");
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Ids of the live entered threads.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.inner
            .registry
            .live()
            .iter()
            .map(|thread| thread.id())
            .collect()
    }

    /// Number of live entered threads.
    pub fn thread_count(&self) -> usize {
        self.inner.registry.purge();
        self.inner.registry.len()
    }

    /// Whether `thread` is entered in this coordinator.
    pub fn is_entered(&self, thread: ThreadId) -> bool {
        self.inner.registry.contains(thread)
    }

    /// State of an entered thread.
    pub fn thread(&self, thread: ThreadId) -> Option<Arc<ThreadSafepoint>> {
        self.inner.registry.get(thread)
    }

    /// Receive [`SafepointEvent`]s published from now on.
    pub fn subscribe(&self) -> Receiver<SafepointEvent> {
        let capacity = self.inner.config.load().event_capacity;
        self.inner.events.subscribe(capacity)
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> SafepointStats {
        self.inner.stats.snapshot()
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<SafepointConfig> {
        self.inner.config.load_full()
    }

    /// Replace the configuration; polling threads observe it at their next poll.
    pub fn reconfigure(&self, config: SafepointConfig) {
        self.inner
            .safepoint_a_lot
            .store(config.safepoint_a_lot, Ordering::Relaxed);
        self.inner
            .collect_stats
            .store(config.collect_stats, Ordering::Relaxed);
        tracing::debug!(coordinator = self.inner.id, ?config, "safepoint coordinator reconfigured");
        self.inner.config.store(Arc::new(config));
    }
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SafepointCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafepointCoordinator")
            .field("id", &self.inner.id)
            .field("threads", &self.inner.registry)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
