//! Cooperative thread interruption.
//!
//! Every thread owns a sticky "interrupted" flag. Interrupting a thread sets
//! the flag, unparks the thread and wakes whatever interruptible primitive the
//! thread has registered itself as blocked on. Interruptible primitives check
//! (and consume) the flag before and after waiting and report
//! [`Interrupted`] instead of blocking further.
//!
//! The [`Interrupter`] trait is the pluggable seam used by
//! [`LocalSafepoint::set_blocked`](crate::safepoint::LocalSafepoint::set_blocked)
//! to force a thread out of a blocking call. [`ThreadInterrupter`] is the
//! standard implementation on top of the per-thread flag.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread, ThreadId};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Signal returned by an interruptible blocking call that was interrupted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("thread interrupted")]
pub struct Interrupted;

/// Something a blocked thread can be woken from.
///
/// Implementations must not block for long and must not run user code; `wake`
/// is called from the interrupting thread.
pub trait Wakeable: Send + Sync {
    fn wake(&self);
}

struct InterruptState {
    interrupted: AtomicBool,
    thread: Thread,
    blocker: Mutex<Option<Arc<dyn Wakeable>>>,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState {
        interrupted: AtomicBool::new(false),
        thread: thread::current(),
        blocker: Mutex::new(None),
    });
}

/// Capability to interrupt one specific thread.
///
/// Holding a handle does not keep the thread running; it only refers to the
/// thread's interrupt flag.
///
/// # Examples
///
/// ```
/// use thread_safepoint::interrupt::{self, InterruptHandle};
///
/// let me = InterruptHandle::current();
/// me.interrupt();
/// assert!(interrupt::interrupted());
/// assert!(!interrupt::interrupted());
/// ```
#[derive(Clone)]
pub struct InterruptHandle {
    state: Arc<InterruptState>,
}

impl InterruptHandle {
    /// Handle for the calling thread.
    pub fn current() -> Self {
        Self {
            state: CURRENT.with(Arc::clone),
        }
    }

    /// Id of the thread this handle interrupts.
    pub fn thread_id(&self) -> ThreadId {
        self.state.thread.id()
    }

    /// Name of the thread this handle interrupts.
    pub fn thread_name(&self) -> Option<&str> {
        self.state.thread.name()
    }

    /// Set the thread's interrupted flag and wake it from any interruptible wait.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
        let blocker = self.state.blocker.lock().clone();
        if let Some(blocker) = blocker {
            blocker.wake();
        }
        self.state.thread.unpark();
    }

    /// Whether the thread's interrupt flag is set, without clearing it.
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("thread", &self.thread_id())
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Test and clear the calling thread's interrupted flag.
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.swap(false, Ordering::SeqCst))
}

/// Test the calling thread's interrupted flag without clearing it.
pub fn is_interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.load(Ordering::SeqCst))
}

/// Consume a pending interrupt of the calling thread as an [`Interrupted`] error.
pub fn check_interrupted() -> Result<(), Interrupted> {
    if interrupted() { Err(Interrupted) } else { Ok(()) }
}

/// Registration of the calling thread as blocked on a [`Wakeable`].
///
/// The registration is removed when the guard is dropped. Guards must be
/// dropped on the thread that created them.
#[must_use = "the blocker is unregistered when the guard is dropped"]
pub struct BlockerGuard {
    state: Arc<InterruptState>,
    previous: Option<Arc<dyn Wakeable>>,
}

/// Register `blocker` to be woken when the calling thread is interrupted.
pub fn register_blocker(blocker: Arc<dyn Wakeable>) -> BlockerGuard {
    let state = CURRENT.with(Arc::clone);
    let previous = state.blocker.lock().replace(blocker);
    BlockerGuard { state, previous }
}

impl Drop for BlockerGuard {
    fn drop(&mut self) {
        *self.state.blocker.lock() = self.previous.take();
    }
}

/// Park the calling thread until it is unparked, interrupted or `timeout` elapses.
///
/// Spurious returns are possible, as with [`std::thread::park`]; callers loop on
/// their own condition.
pub fn park_interruptibly(timeout: Option<Duration>) -> Result<(), Interrupted> {
    check_interrupted()?;
    match timeout {
        Some(timeout) => thread::park_timeout(timeout),
        None => thread::park(),
    }
    check_interrupted()
}

/// Sleep for `duration` unless interrupted first.
pub fn sleep_interruptibly(duration: Duration) -> Result<(), Interrupted> {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return check_interrupted();
        }
        park_interruptibly(Some(deadline - now))?;
    }
}

/// Strategy for forcing a thread out of a blocking call.
///
/// `interrupt` is invoked by submitting threads after the target's blocked
/// descriptor has been read and released; it may inspect the target's
/// [`ThreadSafepoint`](crate::thread::ThreadSafepoint). It must not block, as
/// the target waits for it before leaving the blocking call.
/// `reset_interrupted` is invoked by the interrupted thread itself after it
/// wakes, possibly several times, and must be idempotent.
pub trait Interrupter: Send + Sync {
    /// Force `thread` out of its blocking call.
    fn interrupt(&self, thread: &InterruptHandle);
    /// Clear the calling thread's interrupted state.
    fn reset_interrupted(&self);
}

/// Standard interrupter based on the per-thread interrupt flag.
///
/// # Examples
///
/// ```
/// use thread_safepoint::interrupt::{self, InterruptHandle, Interrupter, ThreadInterrupter};
///
/// let interrupter = ThreadInterrupter;
/// interrupter.interrupt(&InterruptHandle::current());
/// assert!(interrupt::is_interrupted());
/// interrupter.reset_interrupted();
/// interrupter.reset_interrupted();
/// assert!(!interrupt::is_interrupted());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadInterrupter;

impl ThreadInterrupter {
    /// Shared instance suitable for [`set_blocked`](crate::safepoint::LocalSafepoint::set_blocked).
    pub fn shared() -> Arc<dyn Interrupter> {
        static SHARED: OnceLock<Arc<dyn Interrupter>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(ThreadInterrupter)))
    }
}

impl Interrupter for ThreadInterrupter {
    fn interrupt(&self, thread: &InterruptHandle) {
        thread.interrupt();
    }

    fn reset_interrupted(&self) {
        interrupted();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWake(AtomicUsize);

    impl Wakeable for CountingWake {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn interrupt_flag_is_sticky_until_cleared() {
        let handle = InterruptHandle::current();
        assert!(!handle.is_interrupted());

        handle.interrupt();
        assert!(is_interrupted());
        assert!(is_interrupted());
        assert_eq!(check_interrupted(), Err(Interrupted));
        assert_eq!(check_interrupted(), Ok(()));
    }

    #[test]
    fn reset_is_idempotent() {
        let interrupter = ThreadInterrupter;
        interrupter.interrupt(&InterruptHandle::current());
        interrupter.reset_interrupted();
        for _ in 0..3 {
            interrupter.reset_interrupted();
            assert!(!is_interrupted());
        }
    }

    #[test]
    fn interrupt_wakes_registered_blocker() {
        let blocker = Arc::new(CountingWake(AtomicUsize::new(0)));
        let handle = InterruptHandle::current();
        {
            let _guard = register_blocker(blocker.clone());
            handle.interrupt();
        }
        handle.interrupt();

        assert_eq!(blocker.0.load(Ordering::SeqCst), 1);
        assert!(interrupted());
    }

    #[test]
    fn park_returns_interrupted_from_other_thread() {
        let (tx, rx) = flume::bounded(1);
        let waiter = thread::spawn(move || {
            tx.send(InterruptHandle::current()).unwrap();
            loop {
                if park_interruptibly(None).is_err() {
                    return true;
                }
            }
        });

        rx.recv().unwrap().interrupt();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn sleep_completes_without_interrupt() {
        let start = Instant::now();
        assert_eq!(sleep_interruptibly(Duration::from_millis(5)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
