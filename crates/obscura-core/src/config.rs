//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the pipeline scheduler.
///
/// The ready-channel wakeup is authoritative for backpressure retry; the
/// retry interval is only a safety net against a lost wakeup.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Safety-net interval for the queue backpressure retry wait, in
    /// milliseconds.
    pub queue_retry_interval_ms: u64,
    /// Capacity of the bounded "ready to enqueue" wakeup channel.
    pub ready_channel_capacity: usize,
    /// Whether `end_configure` runs node init/config concurrently by
    /// default.
    pub parallel_init: bool,
    /// User id reported through the result callback.
    pub user_id: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_retry_interval_ms: 33,
            ready_channel_capacity: 64,
            parallel_init: false,
            user_id: 0,
        }
    }
}

impl SchedulerConfig {
    /// Returns the retry interval as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.queue_retry_interval_ms)
    }
}
