//! Code locations supplied by the interpreter at safepoint polls.

use std::fmt;
use std::sync::Arc;

/// Opaque description of the current code position.
///
/// The interpreter hands a location to every poll; actions observe it through
/// [`Access::location`](crate::action::Access::location). Cloning is cheap.
///
/// # Examples
///
/// ```
/// use thread_safepoint::location::Location;
///
/// let loop_head = Location::new("fib:loop");
/// assert_eq!(loop_head.name(), "fib:loop");
/// assert!(!loop_head.is_host());
/// assert!(Location::host().is_host());
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Location {
    name: Arc<str>,
    host: bool,
}

impl Location {
    /// Guest location named `name`.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            host: false,
        }
    }

    /// Location used for polls issued by host code rather than guest code.
    pub fn host() -> Self {
        Self {
            name: Arc::from("<host>"),
            host: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the [`host`](Self::host) location.
    pub fn is_host(&self) -> bool {
        self.host
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Location").field(&&*self.name).finish()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Location {
    fn from(name: &str) -> Self {
        Location::new(name)
    }
}
