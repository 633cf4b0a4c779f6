//! Map configuration.

use std::time::Duration;

/// Configuration for a [`SnapMap`](crate::SnapMap).
///
/// Diagnostics are emitted through the `tracing` facade; install a subscriber
/// in the embedding application to collect them.
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the reclaimer sweeps versions no longer visible to any
    /// active or future reader.
    pub gc_interval: Duration,

    /// How often the deadlock detector scans the wait-for graph.
    pub deadlock_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(5),
            deadlock_check_interval: Duration::from_millis(100),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the version reclamation interval.
    #[must_use]
    pub const fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Sets the deadlock detection interval.
    #[must_use]
    pub const fn deadlock_check_interval(mut self, interval: Duration) -> Self {
        self.deadlock_check_interval = interval;
        self
    }
}
