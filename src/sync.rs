//! Interruptible blocking primitives.
//!
//! These are the blocking calls threads typically wrap with
//! [`LocalSafepoint::set_blocked`](crate::safepoint::LocalSafepoint::set_blocked).
//! Each registers itself as the waiting thread's blocker so that
//! [`InterruptHandle::interrupt`](crate::interrupt::InterruptHandle::interrupt)
//! wakes it, and reports [`Interrupted`] when the thread's flag is set.

use crate::interrupt::{self, Interrupted, Wakeable};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SemaphoreInner {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Wakeable for SemaphoreInner {
    fn wake(&self) {
        let _permits = self.permits.lock();
        self.available.notify_all();
    }
}

/// Counting semaphore whose acquisition can be interrupted.
///
/// # Examples
///
/// ```
/// use thread_safepoint::sync::Semaphore;
///
/// let semaphore = Semaphore::new(1);
/// assert!(semaphore.try_acquire());
/// assert!(!semaphore.try_acquire());
/// semaphore.release();
/// semaphore.acquire_interruptibly().unwrap();
/// ```
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// Semaphore holding `permits` permits.
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                permits: Mutex::new(permits),
                available: Condvar::new(),
            }),
        }
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> usize {
        *self.inner.permits.lock()
    }

    /// Take a permit if one is available, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.inner.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Take one permit, blocking until one is available or the thread is interrupted.
    pub fn acquire_interruptibly(&self) -> Result<(), Interrupted> {
        let _blocker = interrupt::register_blocker(self.inner.clone());
        let mut permits = self.inner.permits.lock();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return Ok(());
            }
            interrupt::check_interrupted()?;
            self.inner.available.wait(&mut permits);
        }
    }

    /// Like [`acquire_interruptibly`](Self::acquire_interruptibly) but gives up after `timeout`.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        let deadline = Instant::now() + timeout;
        let _blocker = interrupt::register_blocker(self.inner.clone());
        let mut permits = self.inner.permits.lock();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return Ok(true);
            }
            interrupt::check_interrupted()?;
            if self
                .inner
                .available
                .wait_until(&mut permits, deadline)
                .timed_out()
                && *permits == 0
            {
                return Ok(false);
            }
        }
    }

    /// Return one permit, waking a waiter.
    pub fn release(&self) {
        self.release_many(1);
    }

    /// Return `count` permits.
    pub fn release_many(&self, count: usize) {
        let mut permits = self.inner.permits.lock();
        *permits += count;
        self.inner.available.notify_all();
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("permits", &self.available_permits())
            .finish()
    }
}

struct MonitorInner<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T: Send> Wakeable for MonitorInner<T> {
    fn wake(&self) {
        let _value = self.value.lock();
        self.changed.notify_all();
    }
}

/// Mutex-protected value with an interruptible condition.
///
/// # Examples
///
/// ```
/// use thread_safepoint::sync::Monitor;
///
/// let monitor = Monitor::new(0u32);
/// *monitor.lock() += 1;
/// monitor.notify_all();
/// let guard = monitor.wait_while_interruptibly(|v| *v == 0).unwrap();
/// assert_eq!(*guard, 1);
/// ```
pub struct Monitor<T> {
    inner: Arc<MonitorInner<T>>,
}

impl<T> Clone for Monitor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Monitor<T> {
    /// Monitor guarding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                value: Mutex::new(value),
                changed: Condvar::new(),
            }),
        }
    }

    /// Lock the guarded value.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.value.lock()
    }

    /// Wait once for a notification while holding `guard`.
    ///
    /// The lock is re-acquired before returning, also when interrupted.
    pub fn wait_interruptibly(&self, guard: &mut MutexGuard<'_, T>) -> Result<(), Interrupted> {
        let _blocker = interrupt::register_blocker(self.inner.clone());
        interrupt::check_interrupted()?;
        self.inner.changed.wait(guard);
        interrupt::check_interrupted()
    }

    /// Lock and wait until `condition` no longer holds.
    pub fn wait_while_interruptibly<F>(&self, mut condition: F) -> Result<MutexGuard<'_, T>, Interrupted>
    where
        F: FnMut(&mut T) -> bool,
    {
        let mut guard = self.lock();
        while condition(&mut guard) {
            self.wait_interruptibly(&mut guard)?;
        }
        Ok(guard)
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.inner.changed.notify_all();
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.inner.changed.notify_one();
    }
}

impl<T: fmt::Debug> fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.value.try_lock() {
            Some(value) => f.debug_tuple("Monitor").field(&*value).finish(),
            None => f.debug_tuple("Monitor").field(&"<locked>").finish(),
        }
    }
}
