//! Registry of the threads entered in one coordinator.
//!
//! Entries are weak: the registry never keeps a thread's state alive after
//! the thread has retired.

use crate::thread::ThreadSafepoint;
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

#[derive(Default)]
pub(crate) struct ThreadRegistry {
    threads: DashMap<ThreadId, Weak<ThreadSafepoint>>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, thread: &Arc<ThreadSafepoint>) {
        self.threads.insert(thread.id(), Arc::downgrade(thread));
    }

    /// Remove `thread` unless its slot was already reused by a newer state.
    pub(crate) fn unregister(&self, thread: &ThreadSafepoint) {
        self.threads.remove_if(&thread.id(), |_, entry| {
            entry.upgrade().is_none_or(|live| std::ptr::eq(&*live, thread))
        });
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<Arc<ThreadSafepoint>> {
        self.threads.get(&id).and_then(|entry| entry.upgrade())
    }

    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.get(id).is_some()
    }

    /// Live threads in no particular order.
    pub(crate) fn live(&self) -> Vec<Arc<ThreadSafepoint>> {
        self.threads
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    /// Drop entries whose thread state no longer exists.
    pub(crate) fn purge(&self) -> usize {
        let before = self.threads.len();
        self.threads.retain(|_, entry| entry.strong_count() > 0);
        before - self.threads.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("threads", &self.threads.len())
            .finish()
    }
}
