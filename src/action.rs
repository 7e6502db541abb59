//! Thread-local actions and the access context handed to them.
//!
//! An action is an immutable descriptor: three independent flags plus a
//! `perform` callback and optional blocked/unblocked notifications. The same
//! action may be submitted any number of times; cloning shares the callbacks.

use crate::error::{ActionError, SafepointError, SafepointResult};
use crate::location::Location;
use crate::thread::ThreadSafepoint;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

bitflags! {
    /// Independent properties of a [`ThreadLocalAction`].
    ///
    /// # Examples
    ///
    /// ```
    /// use thread_safepoint::action::ActionFlags;
    ///
    /// let flags = ActionFlags::SIDE_EFFECTING | ActionFlags::RECURRING;
    /// assert!(flags.contains(ActionFlags::RECURRING));
    /// assert!(!flags.contains(ActionFlags::SYNCHRONOUS));
    /// ```
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ActionFlags: u8 {
        /// May mutate guest-visible state and raise guest-visible errors.
        const SIDE_EFFECTING = 0b001;
        /// All targets rendezvous before and after performing.
        const SYNCHRONOUS = 0b010;
        /// Re-enqueued on each target after every performance until cancelled.
        const RECURRING = 0b100;
    }
}

type PerformFn = dyn Fn(&Access<'_>) -> Result<(), ActionError> + Send + Sync;
type NotifyFn = dyn Fn(&Access<'_>) + Send + Sync;

struct ActionInner {
    name: Option<String>,
    flags: ActionFlags,
    perform: Box<PerformFn>,
    on_blocked: Option<Box<NotifyFn>>,
    on_unblocked: Option<Box<NotifyFn>>,
}

/// A unit of work executed on target threads at their next safepoint.
///
/// # Examples
///
/// ```
/// use thread_safepoint::action::ThreadLocalAction;
///
/// let action = ThreadLocalAction::new(false, false, |access| {
///     assert!(access.is_current_thread());
///     Ok(())
/// });
/// assert!(!action.is_side_effecting());
/// assert!(!action.is_recurring());
/// ```
#[derive(Clone)]
pub struct ThreadLocalAction {
    inner: Arc<ActionInner>,
}

impl ThreadLocalAction {
    /// Create a non-recurring action without notification callbacks.
    pub fn new<F>(side_effecting: bool, synchronous: bool, perform: F) -> Self
    where
        F: Fn(&Access<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        let mut flags = ActionFlags::empty();
        flags.set(ActionFlags::SIDE_EFFECTING, side_effecting);
        flags.set(ActionFlags::SYNCHRONOUS, synchronous);
        Self {
            inner: Arc::new(ActionInner {
                name: None,
                flags,
                perform: Box::new(perform),
                on_blocked: None,
                on_unblocked: None,
            }),
        }
    }

    /// Builder for actions with a name, hooks or the recurring flag.
    pub fn builder() -> ActionBuilder {
        ActionBuilder::default()
    }

    /// Name used in logs.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// All flags of the action.
    pub fn flags(&self) -> ActionFlags {
        self.inner.flags
    }

    /// Whether the action may mutate guest state and raise guest errors.
    pub fn is_side_effecting(&self) -> bool {
        self.inner.flags.contains(ActionFlags::SIDE_EFFECTING)
    }

    /// Whether targets rendezvous before and after performing.
    pub fn is_synchronous(&self) -> bool {
        self.inner.flags.contains(ActionFlags::SYNCHRONOUS)
    }

    /// Whether the action re-enqueues itself after each performance.
    pub fn is_recurring(&self) -> bool {
        self.inner.flags.contains(ActionFlags::RECURRING)
    }

    pub(crate) fn perform(&self, access: &Access<'_>) -> Result<(), ActionError> {
        (self.inner.perform)(access)
    }

    pub(crate) fn notify_blocked(&self, access: &Access<'_>) {
        if let Some(callback) = &self.inner.on_blocked {
            callback(access);
        }
    }

    pub(crate) fn notify_unblocked(&self, access: &Access<'_>) {
        if let Some(callback) = &self.inner.on_unblocked {
            callback(access);
        }
    }
}

impl fmt::Debug for ThreadLocalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalAction")
            .field("name", &self.inner.name)
            .field("flags", &self.inner.flags)
            .field("on_blocked", &self.inner.on_blocked.is_some())
            .field("on_unblocked", &self.inner.on_unblocked.is_some())
            .finish()
    }
}

/// Builder for actions with recurrence or blocked/unblocked notifications.
///
/// # Examples
///
/// ```
/// use thread_safepoint::action::ThreadLocalAction;
///
/// let sampler = ThreadLocalAction::builder()
///     .name("sampler")
///     .recurring(true)
///     .on_blocked(|_| {})
///     .build(|_| Ok(()))
///     .unwrap();
/// assert!(sampler.is_recurring());
///
/// let invalid = ThreadLocalAction::builder()
///     .synchronous(true)
///     .recurring(true)
///     .build(|_| Ok(()));
/// assert!(invalid.is_err());
/// ```
#[derive(Default)]
pub struct ActionBuilder {
    name: Option<String>,
    flags: ActionFlags,
    on_blocked: Option<Box<NotifyFn>>,
    on_unblocked: Option<Box<NotifyFn>>,
}

impl ActionBuilder {
    /// Name used in logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Mark the action side-effecting.
    pub fn side_effecting(mut self, enabled: bool) -> Self {
        self.flags.set(ActionFlags::SIDE_EFFECTING, enabled);
        self
    }

    /// Mark the action synchronous.
    pub fn synchronous(mut self, enabled: bool) -> Self {
        self.flags.set(ActionFlags::SYNCHRONOUS, enabled);
        self
    }

    /// Mark the action recurring.
    pub fn recurring(mut self, enabled: bool) -> Self {
        self.flags.set(ActionFlags::RECURRING, enabled);
        self
    }

    /// Replace all flags at once.
    pub fn flags(mut self, flags: ActionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Called when a pending occurrence's target thread enters a blocking call.
    pub fn on_blocked<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Access<'_>) + Send + Sync + 'static,
    {
        self.on_blocked = Some(Box::new(callback));
        self
    }

    /// Called when a pending occurrence's target thread leaves a blocking call.
    pub fn on_unblocked<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Access<'_>) + Send + Sync + 'static,
    {
        self.on_unblocked = Some(Box::new(callback));
        self
    }

    /// Finish the action.
    ///
    /// # Errors
    ///
    /// Returns [`SafepointError::InvalidAction`] for actions that are both
    /// synchronous and recurring.
    pub fn build<F>(self, perform: F) -> SafepointResult<ThreadLocalAction>
    where
        F: Fn(&Access<'_>) -> Result<(), ActionError> + Send + Sync + 'static,
    {
        if self
            .flags
            .contains(ActionFlags::SYNCHRONOUS | ActionFlags::RECURRING)
        {
            return Err(SafepointError::InvalidAction(
                "synchronous actions cannot be recurring".to_string(),
            ));
        }

        Ok(ThreadLocalAction {
            inner: Arc::new(ActionInner {
                name: self.name,
                flags: self.flags,
                perform: Box::new(perform),
                on_blocked: self.on_blocked,
                on_unblocked: self.on_unblocked,
            }),
        })
    }
}

/// Execution context for one callback invocation.
///
/// Borrowed for the duration of a single `perform`, `on_blocked` or
/// `on_unblocked` call; it cannot outlive that call.
pub struct Access<'a> {
    thread: &'a ThreadSafepoint,
    location: &'a Location,
    action: &'a ThreadLocalAction,
}

impl<'a> Access<'a> {
    pub(crate) fn new(
        thread: &'a ThreadSafepoint,
        location: &'a Location,
        action: &'a ThreadLocalAction,
    ) -> Self {
        Self {
            thread,
            location,
            action,
        }
    }

    /// Per-thread state of the thread running the callback.
    pub fn thread(&self) -> &ThreadSafepoint {
        self.thread
    }

    /// Id of the performing thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    /// Location of the safepoint poll that triggered the callback.
    pub fn location(&self) -> &Location {
        self.location
    }

    /// The action being performed.
    pub fn action(&self) -> &ThreadLocalAction {
        self.action
    }

    /// Whether the performed action is side-effecting.
    pub fn is_side_effecting(&self) -> bool {
        self.action.is_side_effecting()
    }

    /// Whether the performed action is synchronous.
    pub fn is_synchronous(&self) -> bool {
        self.action.is_synchronous()
    }

    /// Whether the caller runs on the performing thread.
    pub fn is_current_thread(&self) -> bool {
        self.thread.id() == std::thread::current().id()
    }
}

impl fmt::Debug for Access<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Access")
            .field("thread", &self.thread.id())
            .field("location", self.location)
            .field("action", self.action)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sets_only_requested_flags() {
        let action = ThreadLocalAction::new(true, false, |_| Ok(()));
        assert_eq!(action.flags(), ActionFlags::SIDE_EFFECTING);

        let action = ThreadLocalAction::new(false, true, |_| Ok(()));
        assert_eq!(action.flags(), ActionFlags::SYNCHRONOUS);
    }

    #[test]
    fn builder_keeps_name_and_callbacks() {
        let action = ThreadLocalAction::builder()
            .name("stack-sampler")
            .side_effecting(false)
            .recurring(true)
            .on_blocked(|_| {})
            .on_unblocked(|_| {})
            .build(|_| Ok(()))
            .unwrap();

        assert_eq!(action.name(), Some("stack-sampler"));
        assert!(action.is_recurring());
        let debug = format!("{action:?}");
        assert!(debug.contains("on_blocked: true"));
        assert!(debug.contains("on_unblocked: true"));
    }

    #[test]
    fn synchronous_recurring_is_rejected() {
        let result = ThreadLocalAction::builder()
            .flags(ActionFlags::all())
            .build(|_| Ok(()));
        assert!(matches!(result, Err(SafepointError::InvalidAction(_))));
    }

    #[test]
    fn clones_share_callbacks() {
        let action = ThreadLocalAction::new(false, false, |_| Ok(()));
        let clone = action.clone();
        assert!(Arc::ptr_eq(&action.inner, &clone.inner));
    }
}
