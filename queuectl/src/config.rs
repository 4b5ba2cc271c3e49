use std::time::Duration;

use chrono::TimeDelta;

/// Runtime settings for enqueueing and for worker loops.
///
/// `max_retries` and `backoff_base` are copied onto each job when it is enqueued; the remaining
/// settings are read once when a worker loop starts.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_retries: u32,
    pub backoff_base: u32,
    /// How long an idle worker waits before polling the store again.
    pub poll_interval: Duration,
    /// How long a `processing` job may go without a heartbeat before it is considered abandoned.
    ///
    /// Heartbeats continue while a command runs, so this only needs to exceed
    /// `heartbeat_interval` by a comfortable margin; it is kept generous by default.
    pub lease_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Commands running longer than this are killed and count as failed.
    pub job_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            poll_interval: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(5),
            job_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl Config {
    pub(crate) fn lease_timeout_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.lease_timeout).unwrap_or(TimeDelta::MAX)
    }
}
