//! Counters describing coordinator activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of coordinator counters.
///
/// `polls` is only maintained while
/// [`SafepointConfig::collect_stats`](crate::config::SafepointConfig::collect_stats)
/// is enabled; every other counter is always maintained.
///
/// # Examples
///
/// ```
/// use thread_safepoint::stats::SafepointStats;
///
/// let stats = SafepointStats { polls: 10, hits: 2, ..Default::default() };
/// assert_eq!(stats.hit_rate(), 0.2);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafepointStats {
    /// Fast-path poll checks.
    pub polls: u64,
    /// Slow-path executions.
    pub hits: u64,
    /// Occurrences submitted across all targets.
    pub submitted: u64,
    pub performed: u64,
    pub cancelled: u64,
    /// Occurrences flushed from retired threads or rejected by disposed ones.
    pub dropped: u64,
    /// Interrupts sent to blocked threads.
    pub interrupts: u64,
    /// Entries into `set_blocked`.
    pub blocked: u64,
}

impl SafepointStats {
    /// Fraction of counted polls that took the slow path.
    pub fn hit_rate(&self) -> f64 {
        if self.polls == 0 {
            0.0
        } else {
            self.hits as f64 / self.polls as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct SafepointCounters {
    polls: AtomicU64,
    hits: AtomicU64,
    submitted: AtomicU64,
    performed: AtomicU64,
    cancelled: AtomicU64,
    dropped: AtomicU64,
    interrupts: AtomicU64,
    blocked: AtomicU64,
}

macro_rules! counter {
    ($($record:ident => $field:ident),* $(,)?) => {
        $(
            #[inline]
            pub(crate) fn $record(&self, count: u64) {
                self.$field.fetch_add(count, Ordering::Relaxed);
            }
        )*
    };
}

impl SafepointCounters {
    counter! {
        record_polls => polls,
        record_hits => hits,
        record_submitted => submitted,
        record_performed => performed,
        record_cancelled => cancelled,
        record_dropped => dropped,
        record_interrupts => interrupts,
        record_blocked => blocked,
    }

    pub(crate) fn snapshot(&self) -> SafepointStats {
        SafepointStats {
            polls: self.polls.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            performed: self.performed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}
