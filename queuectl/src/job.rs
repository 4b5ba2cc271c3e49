use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod builder;

/// The unique identifier of a job.
///
/// Ids are either provided by the client at enqueue time or generated by
/// [`builder::JobBuilder`] as UUIDv7 strings.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identifier of a worker loop. Unique per host while the worker is alive.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<WorkerId> for String {
    fn from(value: WorkerId) -> Self {
        value.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work: a shell command plus its retry bookkeeping.
///
/// `max_retries` and `backoff_base` are snapshots of the configuration at enqueue time so that
/// later configuration changes do not affect jobs already in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub backoff_base: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<WorkerId>,
    pub last_error: Option<String>,
    pub result_code: Option<i32>,
}

impl Job {
    pub fn builder() -> builder::JobBuilder {
        Default::default()
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_eligible_at.map_or(true, |at| at <= now)
    }

    /// The timestamp the claim protocol orders ready jobs by.
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.next_eligible_at.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job state {0:?}, expected one of pending, processing, completed, failed, dead")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseJobStateError(s.to_owned()))
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use super::*;

    fn pending_job(now: DateTime<Utc>) -> Job {
        Job {
            id: "job".into(),
            command: "true".to_owned(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: 3,
            backoff_base: 2,
            created_at: now,
            updated_at: now,
            next_eligible_at: None,
            claimed_by: None,
            last_error: None,
            result_code: None,
        }
    }

    #[test]
    fn job_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert_eq!("DEAD".parse::<JobState>(), Ok(JobState::Dead));
        assert!("sleeping".parse::<JobState>().is_err());
    }

    #[test]
    fn eligibility_respects_next_eligible_at() {
        let now = Utc::now();
        let mut job = pending_job(now);
        assert!(job.is_eligible(now));

        job.next_eligible_at = Some(now + TimeDelta::seconds(2));
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + TimeDelta::seconds(2)));
        assert_eq!(job.ready_at(), now + TimeDelta::seconds(2));

        job.state = JobState::Processing;
        assert!(!job.is_eligible(now + TimeDelta::hours(1)));
    }
}
