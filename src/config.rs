//! Coordinator configuration.
//!
//! Configuration is a plain value with chained setters. A coordinator keeps it
//! behind an `ArcSwap` so it can be replaced while threads are polling.

use std::env;
use std::str::FromStr;

/// Default capacity of each event subscriber's channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Environment variable enabling `safepoint_a_lot`.
pub const ENV_SAFEPOINT_A_LOT: &str = "SAFEPOINT_A_LOT";
/// Environment variable enabling statistics collection.
pub const ENV_SAFEPOINT_STATS: &str = "SAFEPOINT_STATS";
/// Environment variable overriding the event channel capacity.
pub const ENV_SAFEPOINT_EVENT_CAPACITY: &str = "SAFEPOINT_EVENT_CAPACITY";

/// Tuning knobs for a [`SafepointCoordinator`](crate::safepoint::SafepointCoordinator).
///
/// # Examples
///
/// ```
/// use thread_safepoint::config::SafepointConfig;
///
/// let config = SafepointConfig::default()
///     .with_safepoint_a_lot(true)
///     .with_collect_stats(true);
/// assert!(config.safepoint_a_lot);
/// assert!(config.collect_stats);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointConfig {
    /// Force every poll through the slow path, even with nothing pending.
    /// Stress option for shaking out missing safepoint checks.
    pub safepoint_a_lot: bool,
    /// Count every poll, including fast-path polls.
    pub collect_stats: bool,
    /// Bounded capacity of each event subscriber channel.
    pub event_capacity: usize,
}

impl Default for SafepointConfig {
    fn default() -> Self {
        Self {
            safepoint_a_lot: false,
            collect_stats: false,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SafepointConfig {
    /// Take the poll slow path on every poll.
    pub fn with_safepoint_a_lot(mut self, enabled: bool) -> Self {
        self.safepoint_a_lot = enabled;
        self
    }

    /// Count fast-path polls.
    pub fn with_collect_stats(mut self, enabled: bool) -> Self {
        self.collect_stats = enabled;
        self
    }

    /// Channel capacity of new event subscribers.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Build a configuration from defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Unparsable values keep the default and are reported with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            safepoint_a_lot: parse_flag(&lookup, ENV_SAFEPOINT_A_LOT, defaults.safepoint_a_lot),
            collect_stats: parse_flag(&lookup, ENV_SAFEPOINT_STATS, defaults.collect_stats),
            event_capacity: parse_value(
                &lookup,
                ENV_SAFEPOINT_EVENT_CAPACITY,
                defaults.event_capacity,
            )
            .max(1),
        }
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            _ => {
                tracing::warn!(key, value = %raw, "ignoring unparsable safepoint flag");
                default
            }
        },
    }
}

fn parse_value<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable safepoint setting");
            default
        }),
    }
}
