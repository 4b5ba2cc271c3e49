use chrono::{DateTime, Utc};
use queuectl::store::StoreError;
use sqlx::prelude::FromRow;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub(crate) enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl From<JobState> for queuectl::job::JobState {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Pending => Self::Pending,
            JobState::Processing => Self::Processing,
            JobState::Completed => Self::Completed,
            JobState::Failed => Self::Failed,
            JobState::Dead => Self::Dead,
        }
    }
}

impl From<queuectl::job::JobState> for JobState {
    fn from(value: queuectl::job::JobState) -> Self {
        match value {
            queuectl::job::JobState::Pending => Self::Pending,
            queuectl::job::JobState::Processing => Self::Processing,
            queuectl::job::JobState::Completed => Self::Completed,
            queuectl::job::JobState::Failed => Self::Failed,
            queuectl::job::JobState::Dead => Self::Dead,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub(crate) enum WorkerStatus {
    Running,
    Stopping,
    Stopped,
}

impl From<WorkerStatus> for queuectl::store::WorkerStatus {
    fn from(value: WorkerStatus) -> Self {
        match value {
            WorkerStatus::Running => Self::Running,
            WorkerStatus::Stopping => Self::Stopping,
            WorkerStatus::Stopped => Self::Stopped,
        }
    }
}

impl From<queuectl::store::WorkerStatus> for WorkerStatus {
    fn from(value: queuectl::store::WorkerStatus) -> Self {
        match value {
            queuectl::store::WorkerStatus::Running => Self::Running,
            queuectl::store::WorkerStatus::Stopping => Self::Stopping,
            queuectl::store::WorkerStatus::Stopped => Self::Stopped,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub backoff_base: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub next_eligible_at: Option<i64>,
    pub claimed_by: Option<String>,
    pub last_error: Option<String>,
    pub result_code: Option<i64>,
}

impl TryFrom<Job> for queuectl::job::Job {
    type Error = StoreError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            command: value.command,
            state: value.state.into(),
            attempts: to_u32(value.attempts)?,
            max_retries: to_u32(value.max_retries)?,
            backoff_base: to_u32(value.backoff_base)?,
            created_at: from_millis(value.created_at)?,
            updated_at: from_millis(value.updated_at)?,
            next_eligible_at: value.next_eligible_at.map(from_millis).transpose()?,
            claimed_by: value.claimed_by.map(Into::into),
            last_error: value.last_error,
            result_code: value
                .result_code
                .map(|code| i32::try_from(code).map_err(|_| StoreError::BadState))
                .transpose()?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Worker {
    pub id: String,
    pub pid: i64,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub status: WorkerStatus,
}

impl TryFrom<Worker> for queuectl::store::WorkerRecord {
    type Error = StoreError;

    fn try_from(value: Worker) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            pid: to_u32(value.pid)?,
            started_at: from_millis(value.started_at)?,
            heartbeat_at: from_millis(value.heartbeat_at)?,
            status: value.status.into(),
        })
    }
}

pub(crate) fn millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        tracing::error!(millis, "Timestamp out of range");
        StoreError::BadState
    })
}

fn to_u32(value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|error| {
        tracing::error!(value, ?error, "Column out of range");
        StoreError::BadState
    })
}
