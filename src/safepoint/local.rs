//! Owner-thread side of the coordinator.

use crate::error::{SafepointError, SafepointResult};
use crate::interrupt::{Interrupted, Interrupter, ThreadInterrupter};
use crate::location::Location;
use crate::thread::ThreadSafepoint;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;

use super::coordinator::SafepointCoordinator;

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadSafepoint>>> = const { RefCell::new(None) };
}

/// Scope of a thread's entry in a coordinator.
///
/// Returned by [`SafepointCoordinator::enter_thread`]. While alive, the
/// calling thread's free [`poll`] and [`poll_here`] functions drive this
/// coordinator. Not `Send`: every operation acts on the thread that entered.
///
/// Dropping the last scope of a thread retires it; occurrences still queued
/// are dropped and reported as such on their handles.
pub struct LocalSafepoint {
    state: Arc<ThreadSafepoint>,
    previous: Option<Arc<ThreadSafepoint>>,
    _not_send: PhantomData<*const ()>,
}

impl LocalSafepoint {
    pub(super) fn enter(state: Arc<ThreadSafepoint>) -> Self {
        state.enter();
        let previous = CURRENT.with(|current| current.borrow_mut().replace(Arc::clone(&state)));
        Self {
            state,
            previous,
            _not_send: PhantomData,
        }
    }

    /// Id of the entered thread.
    pub fn id(&self) -> ThreadId {
        self.state.id()
    }

    /// Shared safepoint state of the entered thread.
    pub fn thread(&self) -> &Arc<ThreadSafepoint> {
        &self.state
    }

    /// Coordinator the thread is entered in.
    pub fn coordinator(&self) -> SafepointCoordinator {
        SafepointCoordinator::from_inner(Arc::clone(self.state.coordinator()))
    }

    /// Safepoint check: drain pending actions, if any.
    ///
    /// The check loads the pending count and the coordinator's
    /// `collect_stats` and `safepoint_a_lot` flags; the queue is only touched
    /// when something is pending.
    ///
    /// # Errors
    ///
    /// The first error raised by a performed action. Occurrences after it stay
    /// queued for the next poll.
    #[inline]
    pub fn poll(&self, location: &Location) -> SafepointResult<()> {
        if self.state.should_process() {
            self.state.process(location)
        } else {
            Ok(())
        }
    }

    /// Like [`poll`](Self::poll) but always takes the slow path at `location`.
    pub fn poll_here(&self, location: &Location) -> SafepointResult<()> {
        self.state.process(location)
    }

    /// Run `blocking(arg)` as an interruptible blocking call.
    ///
    /// While blocked, submissions to this thread invoke
    /// `interrupter.interrupt`. `blocking` must then return [`Interrupted`];
    /// the thread resets the interrupter, runs `before_interrupt`, drains its
    /// queue, runs `after_interrupt` and calls `blocking` again. Pending
    /// actions see `notify_blocked` once on entry (or when they arrive) and
    /// `notify_unblocked` once when they are performed, skipped or when this
    /// call returns.
    ///
    /// # Errors
    ///
    /// Errors raised by actions performed while blocked. `after_interrupt` still
    /// runs before the error is returned.
    pub fn set_blocked<T, R, F>(
        &self,
        location: &Location,
        interrupter: Arc<dyn Interrupter>,
        blocking: F,
        arg: &mut T,
        before_interrupt: Option<&mut dyn FnMut(&mut T)>,
        after_interrupt: Option<&mut dyn FnMut(&mut T)>,
    ) -> SafepointResult<R>
    where
        F: FnMut(&mut T) -> Result<R, Interrupted>,
    {
        self.state.set_blocked(
            location,
            interrupter,
            blocking,
            arg,
            before_interrupt,
            after_interrupt,
        )
    }

    /// [`set_blocked`](Self::set_blocked) with the standard [`ThreadInterrupter`] and no hooks.
    ///
    /// # Examples
    ///
    /// ```
    /// use thread_safepoint::location::Location;
    /// use thread_safepoint::safepoint::SafepointCoordinator;
    /// use thread_safepoint::sync::Semaphore;
    ///
    /// let coordinator = SafepointCoordinator::new();
    /// let local = coordinator.enter_thread().unwrap();
    /// let mut semaphore = Semaphore::new(1);
    ///
    /// local
    ///     .set_blocked_thread_interruptible(
    ///         &Location::new("acquire"),
    ///         |semaphore: &mut Semaphore| semaphore.acquire_interruptibly(),
    ///         &mut semaphore,
    ///     )
    ///     .unwrap();
    /// assert_eq!(semaphore.available_permits(), 0);
    /// ```
    pub fn set_blocked_thread_interruptible<T, R, F>(
        &self,
        location: &Location,
        blocking: F,
        arg: &mut T,
    ) -> SafepointResult<R>
    where
        F: FnMut(&mut T) -> Result<R, Interrupted>,
    {
        self.set_blocked(location, ThreadInterrupter::shared(), blocking, arg, None, None)
    }

    /// Allow or withhold side-effecting actions on this thread. Returns the previous setting.
    ///
    /// Withheld actions stay queued; non-side-effecting actions keep draining.
    pub fn set_allow_side_effects(&self, enabled: bool) -> bool {
        let previous = self.state.set_allow_side_effects(enabled);
        if previous != enabled {
            tracing::trace!(thread = ?self.id(), enabled, "side effects toggled");
        }
        previous
    }

    /// Allow or withhold all action processing on this thread. Returns the previous setting.
    pub fn set_allow_actions(&self, enabled: bool) -> bool {
        self.state.set_allow_actions(enabled)
    }

    /// Whether a side-effecting action waits for side effects to be allowed.
    pub fn has_pending_side_effecting_actions(&self) -> bool {
        self.state.has_pending_side_effecting_actions()
    }

    /// Whether anything is queued for this thread.
    pub fn has_pending_actions(&self) -> bool {
        self.state.pending_count() > 0
    }
}

impl Drop for LocalSafepoint {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // Thread-local storage may already be gone during thread teardown.
        let _ = CURRENT.try_with(|current| *current.borrow_mut() = previous);
        if self.state.exit() {
            self.state.retire();
        }
    }
}

impl fmt::Debug for LocalSafepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LocalSafepoint").field(&self.state).finish()
    }
}

/// Safepoint check for the calling thread's current coordinator.
///
/// A no-op on threads that are not entered in any coordinator.
#[inline]
pub fn poll(location: &Location) -> SafepointResult<()> {
    let due = CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .filter(|state| state.should_process())
            .cloned()
    });
    match due {
        Some(state) => state.process(location),
        None => Ok(()),
    }
}

/// Slow-path poll at `location` for the calling thread's current coordinator.
///
/// A no-op on threads that are not entered in any coordinator.
pub fn poll_here(location: &Location) -> SafepointResult<()> {
    match CURRENT.with(|current| current.borrow().clone()) {
        Some(state) => state.process(location),
        None => Ok(()),
    }
}

/// State of the calling thread in its current coordinator.
///
/// # Errors
///
/// [`SafepointError::NotEntered`] if the thread is not entered in any coordinator.
pub fn current() -> SafepointResult<Arc<ThreadSafepoint>> {
    CURRENT
        .with(|current| current.borrow().clone())
        .ok_or(SafepointError::NotEntered)
}
