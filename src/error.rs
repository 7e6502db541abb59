//! Error types for thread-local action coordination.

use thiserror::Error;

/// Message used when a non-side-effecting action raises a guest-visible error.
pub(crate) const NON_SIDE_EFFECTING_GUEST_ERROR: &str =
    "Throwing guest errors is disallowed in non-side-effecting thread local actions.";

/// Errors raised by an action's `perform` callback.
///
/// Guest errors are observable by the program running on the target thread and
/// may only be raised by side-effecting actions. Internal errors are fatal to
/// the current poll and never surface as guest-visible failures.
///
/// # Examples
///
/// ```
/// use thread_safepoint::error::ActionError;
///
/// let guest = ActionError::Guest("division by zero".into());
/// assert_eq!(guest.to_string(), "guest error: division by zero");
/// assert!(guest.is_guest());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("guest error: {0}")]
    Guest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ActionError {
    /// Whether the error is visible to guest code.
    pub fn is_guest(&self) -> bool {
        matches!(self, ActionError::Guest(_))
    }
}

/// Errors that can occur while submitting or processing thread-local actions.
///
/// # Examples
///
/// ```
/// use thread_safepoint::error::{SafepointError, SafepointResult};
///
/// let closed: SafepointResult<()> = Err(SafepointError::Closed);
/// assert!(closed.is_err());
/// assert_eq!(SafepointError::Closed.to_string(), "Safepoint coordinator is closed");
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SafepointError {
    /// A synchronous action was submitted from inside a synchronous action.
    #[error(
        "Recursive synchronous thread local action detected. \
         Synchronous actions may not be submitted while performing a synchronous action."
    )]
    RecursiveSynchronous,
    /// The coordinator no longer accepts submissions or thread entries.
    #[error("Safepoint coordinator is closed")]
    Closed,
    /// The calling thread has not entered a coordinator.
    #[error("Current thread is not entered in a safepoint coordinator")]
    NotEntered,
    /// The action descriptor is not valid.
    #[error("Invalid thread local action: {0}")]
    InvalidAction(String),
    /// An action raised an error while being performed on this thread.
    #[error("Thread local action failed: {0}")]
    Action(ActionError),
    /// Fatal internal error; never guest-visible.
    #[error("Internal safepoint error: {0}")]
    Internal(String),
}

impl SafepointError {
    /// Convert an error raised by `perform` into the error reported from `poll`.
    ///
    /// Non-side-effecting actions are assumed to never raise guest-visible
    /// errors, so a guest error from one is turned into an internal error.
    pub(crate) fn from_action(error: ActionError, side_effecting: bool) -> Self {
        match error {
            ActionError::Guest(_) if !side_effecting => {
                SafepointError::Internal(NON_SIDE_EFFECTING_GUEST_ERROR.to_string())
            }
            other => SafepointError::Action(other),
        }
    }

    /// Whether the error is visible to guest code.
    pub fn is_guest_visible(&self) -> bool {
        matches!(self, SafepointError::Action(ActionError::Guest(_)))
    }
}

/// Result type for safepoint operations
pub type SafepointResult<T> = Result<T, SafepointError>;
