//! Cooperative thread-local actions and safepoints.
//!
//! A language runtime submits [`ThreadLocalAction`]s to one, several or all
//! threads entered in a [`SafepointCoordinator`]. Each target thread performs
//! the action inline at its next safepoint poll, in submission order. Threads
//! parked in wrapped blocking calls are interrupted and resumed so they can
//! take part without polling.
//!
//! ```
//! use thread_safepoint::prelude::*;
//!
//! let coordinator = SafepointCoordinator::new();
//! let local = coordinator.enter_thread().unwrap();
//!
//! let action = ThreadLocalAction::new(false, false, |access| {
//!     assert_eq!(access.location().name(), "main:loop");
//!     Ok(())
//! });
//! let handle = coordinator.submit_all(&action).unwrap();
//!
//! local.poll(&Location::new("main:loop")).unwrap();
//! assert!(handle.is_done());
//! ```

pub mod action;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod interrupt;
pub mod location;
pub mod poll_macros;
mod registry;
pub mod safepoint;
pub mod stats;
pub mod sync;
pub mod thread;

pub use action::{Access, ActionBuilder, ActionFlags, ThreadLocalAction};
pub use config::SafepointConfig;
pub use error::{ActionError, SafepointError, SafepointResult};
pub use events::SafepointEvent;
pub use handle::{ActionHandle, ActionOutcome, OccurrenceState};
pub use interrupt::{Interrupted, Interrupter, ThreadInterrupter};
pub use location::Location;
pub use safepoint::{LocalSafepoint, SafepointCoordinator};
pub use stats::SafepointStats;
pub use thread::ThreadSafepoint;

/// Common imports for runtime code.
pub mod prelude {
    pub use crate::action::{Access, ThreadLocalAction};
    pub use crate::error::{ActionError, SafepointError, SafepointResult};
    pub use crate::events::SafepointEvent;
    pub use crate::handle::{ActionHandle, ActionOutcome};
    pub use crate::interrupt::{Interrupted, Interrupter, ThreadInterrupter};
    pub use crate::location::Location;
    pub use crate::safepoint::{LocalSafepoint, SafepointCoordinator};
}
