//! Watcher configuration.

use crate::watcher::WatchError;
use std::time::Duration;

/// Watcher configuration shared by every session it starts.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Delay between polls of one session. Must be non-zero.
    pub poll_interval: Duration,
    /// Per-session event buffer. A subscriber further behind than this skips events.
    pub event_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            event_capacity: 64,
        }
    }
}

impl WatcherConfig {
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.poll_interval.is_zero() {
            return Err(WatchError::InvalidPollInterval);
        }
        if self.event_capacity == 0 {
            return Err(WatchError::InvalidEventCapacity);
        }
        Ok(())
    }
}
