//! Safepoint engine.
//!
//! Threads enter a [`SafepointCoordinator`] and call [`poll`] at loop
//! back-edges and call boundaries. Actions submitted to a thread run inline on
//! that thread at its next poll, in submission order. Threads parked in a
//! blocking call wrapped by [`LocalSafepoint::set_blocked`] are interrupted so
//! they notice new work without polling.
//!
//! ## Fast path
//!
//! A poll loads the thread's pending count plus two relaxed configuration
//! flags (`collect_stats`, `safepoint_a_lot`). Only when work is pending (or
//! `safepoint_a_lot` is enabled) does it lock the queue and drain.
//!
//! ```
//! use thread_safepoint::location::Location;
//! use thread_safepoint::safepoint::{self, SafepointCoordinator};
//!
//! let coordinator = SafepointCoordinator::new();
//! let _local = coordinator.enter_thread().unwrap();
//! let loop_head = Location::new("loop");
//! for _ in 0..1000 {
//!     safepoint::poll(&loop_head).unwrap();
//! }
//! ```

mod coordinator;
mod local;

pub(crate) use coordinator::CoordinatorInner;
pub use coordinator::SafepointCoordinator;
pub use local::{LocalSafepoint, current, poll, poll_here};
