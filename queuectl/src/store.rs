//! The job store: the single shared, durable resource all workers coordinate through.
//!
//! Every mutating operation of a [`JobStore`] must be atomic with respect to all other callers,
//! including callers in other processes. In particular [`JobStore::claim_next`] must select and
//! transition a job in one atomic step, otherwise two workers could both observe the same pending
//! job and both execute it.
//!
//! Implementations never read the clock themselves; every operation that depends on time takes
//! `now` explicitly.
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Job, JobId, JobState, WorkerId};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job in the `pending` state.
    ///
    /// Fails with [`StoreError::DuplicateId`] if a job with the same id already exists, in which
    /// case the existing record is left untouched.
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError>;

    async fn get(&self, id: &JobId) -> Result<Job, StoreError>;

    /// A snapshot of the jobs, optionally filtered by state, ordered by `(created_at, id)`.
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError>;

    /// Atomically claims the next eligible job for `worker_id`.
    ///
    /// The job with the smallest `(next_eligible_at or created_at, id)` among the pending jobs
    /// that are eligible at `now` is moved to `processing`. Returns `None` when nothing is
    /// eligible.
    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Applies the outcome of an execution, guarded by the transition's expected state and
    /// claimant.
    ///
    /// Fails with [`StoreError::StaleWrite`] if the job has moved on since it was claimed.
    async fn apply_outcome(&self, transition: Transition) -> Result<Job, StoreError>;

    /// Returns every `processing` job whose lease (`updated_at`) is older than `timeout` to
    /// `pending`, clearing `claimed_by`. Attempts are left untouched.
    async fn release_stale_claims(
        &self,
        timeout: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// Moves a `dead` job back to `pending` with its attempts reset to zero.
    async fn revive(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StoreError>;

    async fn summary(&self) -> Result<StateSummary, StoreError>;

    /// Records the worker as `running`, replacing any earlier record with the same id.
    ///
    /// A worker registers before it claims anything, so `processing` jobs still claimed under its
    /// id belong to a previous run that died mid-job. They are returned to `pending` and their
    /// ids returned, sorted.
    async fn register_worker(&self, record: WorkerRecord) -> Result<Vec<JobId>, StoreError>;

    /// Records a heartbeat for the worker and refreshes the lease of any job it is processing.
    ///
    /// Returns the worker's current status so that a stop requested from elsewhere can be
    /// observed.
    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<WorkerStatus, StoreError>;

    /// Asks running workers to stop after their current job. `None` targets every running
    /// worker. Returns the number of workers asked.
    async fn request_stop(&self, worker_id: Option<WorkerId>) -> Result<usize, StoreError>;

    async fn mark_worker_stopped(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Every worker record, ordered by id.
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Deletes every job and worker record.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// A job about to be inserted into a [`JobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: JobId,
    pub command: String,
    pub max_retries: u32,
    pub backoff_base: u32,
}

impl NewJob {
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            created_at: now,
            updated_at: now,
            next_eligible_at: None,
            claimed_by: None,
            last_error: None,
            result_code: None,
        }
    }
}

/// A conditional state change produced by the retry policy.
///
/// The store applies it only when the job is still in `expected_state` and still claimed by
/// `expected_claimant`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub id: JobId,
    pub expected_state: JobState,
    pub expected_claimant: Option<WorkerId>,
    pub new_state: JobState,
    pub attempts: u32,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result_code: Option<i32>,
    pub now: DateTime<Utc>,
}

impl Transition {
    /// The value `claimed_by` takes after the transition.
    pub fn claimed_by(&self) -> Option<WorkerId> {
        match self.new_state {
            JobState::Processing => self.expected_claimant.clone(),
            _ => None,
        }
    }
}

/// The number of jobs in each state. Every state is present, zero-filled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary(BTreeMap<JobState, u64>);

impl Default for StateSummary {
    fn default() -> Self {
        Self(JobState::ALL.into_iter().map(|state| (state, 0)).collect())
    }
}

impl StateSummary {
    pub fn get(&self, state: JobState) -> u64 {
        self.0.get(&state).copied().unwrap_or_default()
    }

    pub fn set(&mut self, state: JobState, count: u64) {
        self.0.insert(state, count);
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (JobState, u64)> + '_ {
        self.0.iter().map(|(state, count)| (*state, *count))
    }
}

impl FromIterator<JobState> for StateSummary {
    fn from_iter<T: IntoIterator<Item = JobState>>(iter: T) -> Self {
        let mut summary = Self::default();
        iter.into_iter()
            .for_each(|state| *summary.0.entry(state).or_default() += 1);
        summary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Running,
    Stopping,
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for a running worker loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            pid: std::process::id(),
            started_at: now,
            heartbeat_at: now,
            status: WorkerStatus::Running,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("A job with id {0} already exists")]
    DuplicateId(JobId),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Worker {0} not found")]
    WorkerNotFound(WorkerId),
    #[error("Job {id} is no longer {expected} under the expected claimant")]
    StaleWrite { id: JobId, expected: JobState },
    #[error("Job {id} is {actual}, the operation requires it to be {required}")]
    InvalidState {
        id: JobId,
        actual: JobState,
        required: JobState,
    },
    #[error("Job store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Job store in bad state")]
    BadState,
}

impl StoreError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
