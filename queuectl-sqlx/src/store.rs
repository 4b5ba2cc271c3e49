use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use queuectl::{
    job::{Job, JobId, JobState, WorkerId},
    store::{JobStore, NewJob, StateSummary, StoreError, Transition, WorkerRecord, WorkerStatus},
};
use tracing::instrument;

use crate::{
    map_err,
    query::{JobFilter, ToQuery},
    types::{self, millis},
    SqliteStore,
};

/// Takes the single row an `... RETURNING` statement produced.
///
/// `RETURNING` statements are always read with `fetch_all`: the statement only completes, and
/// its write only becomes visible to other connections, once every row has been stepped.
fn single<T>(rows: Vec<T>) -> Option<T> {
    rows.into_iter().next()
}

impl SqliteStore {
    async fn current_state(&self, id: &JobId) -> Result<Option<JobState>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, types::JobState>("SELECT state FROM jobs WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?
                .map(Into::into),
        )
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let result = sqlx::query_as::<_, types::Job>(
            r#"INSERT INTO jobs (
                id,
                command,
                state,
                attempts,
                max_retries,
                backoff_base,
                created_at,
                updated_at
            ) VALUES (?, ?, 'pending', 0, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.command.as_str())
        .bind(i64::from(job.max_retries))
        .bind(i64::from(job.backoff_base))
        .bind(millis(now))
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await;

        match result {
            Ok(rows) => single(rows).ok_or(StoreError::BadState)?.try_into(),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(StoreError::DuplicateId(job.id))
            }
            Err(error) => Err(map_err(error)),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        sqlx::query_as::<_, types::Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?
            .try_into()
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        JobFilter { state }
            .query()
            .build_query_as::<types::Job>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }

    #[instrument(skip(self))]
    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        sqlx::query_as::<_, types::Job>(
            r#"UPDATE jobs
            SET
                state = 'processing',
                claimed_by = ?1,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending'
                AND (next_eligible_at IS NULL OR next_eligible_at <= ?2)
                ORDER BY COALESCE(next_eligible_at, created_at), id
                LIMIT 1
            )
            AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker_id.as_str())
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
        .map(single)?
        .map(TryFrom::try_from)
        .transpose()
    }

    #[instrument(skip(self, transition), fields(job_id = %transition.id))]
    async fn apply_outcome(&self, transition: Transition) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, types::Job>(
            r#"UPDATE jobs
            SET
                state = ?,
                attempts = ?,
                next_eligible_at = ?,
                last_error = ?,
                result_code = ?,
                claimed_by = ?,
                updated_at = ?
            WHERE id = ? AND state = ? AND claimed_by IS ?
            RETURNING *
            "#,
        )
        .bind(types::JobState::from(transition.new_state))
        .bind(i64::from(transition.attempts))
        .bind(transition.next_eligible_at.map(millis))
        .bind(transition.last_error.as_deref())
        .bind(transition.result_code)
        .bind(transition.claimed_by().map(String::from))
        .bind(millis(transition.now))
        .bind(transition.id.as_str())
        .bind(types::JobState::from(transition.expected_state))
        .bind(transition.expected_claimant.clone().map(String::from))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
        .map(single)?;

        match row {
            Some(row) => row.try_into(),
            None => match self.current_state(&transition.id).await? {
                None => Err(StoreError::JobNotFound(transition.id)),
                Some(_) => Err(StoreError::StaleWrite {
                    id: transition.id,
                    expected: transition.expected_state,
                }),
            },
        }
    }

    async fn release_stale_claims(
        &self,
        timeout: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let Some(cutoff) = now.checked_sub_signed(timeout) else {
            return Ok(vec![]);
        };
        let mut released = sqlx::query_scalar::<_, String>(
            r#"UPDATE jobs
            SET
                state = 'pending',
                claimed_by = NULL,
                updated_at = ?
            WHERE state = 'processing' AND updated_at < ?
            RETURNING id
            "#,
        )
        .bind(millis(now))
        .bind(millis(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(JobId::from)
        .collect::<Vec<_>>();
        released.sort();
        Ok(released)
    }

    #[instrument(skip(self))]
    async fn revive(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, types::Job>(
            r#"UPDATE jobs
            SET
                state = 'pending',
                attempts = 0,
                next_eligible_at = NULL,
                claimed_by = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'dead'
            RETURNING *
            "#,
        )
        .bind(millis(now))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)
        .map(single)?;

        match row {
            Some(row) => row.try_into(),
            None => match self.current_state(id).await? {
                None => Err(StoreError::JobNotFound(id.clone())),
                Some(actual) => Err(StoreError::InvalidState {
                    id: id.clone(),
                    actual,
                    required: JobState::Dead,
                }),
            },
        }
    }

    async fn summary(&self) -> Result<StateSummary, StoreError> {
        let counts = sqlx::query_as::<_, (types::JobState, i64)>(
            "SELECT state, COUNT(*) FROM jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;

        let mut summary = StateSummary::default();
        for (state, count) in counts {
            summary.set(state.into(), count.try_into().map_err(|_| StoreError::BadState)?);
        }
        Ok(summary)
    }

    #[instrument(skip(self, record), fields(worker_id = %record.id))]
    async fn register_worker(&self, record: WorkerRecord) -> Result<Vec<JobId>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut released = sqlx::query_scalar::<_, String>(
            r#"UPDATE jobs
            SET
                state = 'pending',
                claimed_by = NULL,
                updated_at = ?
            WHERE state = 'processing' AND claimed_by = ?
            RETURNING id
            "#,
        )
        .bind(millis(record.started_at))
        .bind(record.id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(JobId::from)
        .collect::<Vec<_>>();
        released.sort();

        sqlx::query(
            r#"INSERT INTO workers (id, pid, started_at, heartbeat_at, status)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                pid = excluded.pid,
                started_at = excluded.started_at,
                heartbeat_at = excluded.heartbeat_at,
                status = excluded.status
            "#,
        )
        .bind(record.id.as_str())
        .bind(i64::from(record.pid))
        .bind(millis(record.started_at))
        .bind(millis(record.heartbeat_at))
        .bind(types::WorkerStatus::from(record.status))
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(released)
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<WorkerStatus, StoreError> {
        // Writes first so the transaction takes the write lock up front.
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let status = sqlx::query_scalar::<_, types::WorkerStatus>(
            "UPDATE workers SET heartbeat_at = ? WHERE id = ? RETURNING status",
        )
        .bind(millis(now))
        .bind(worker_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)
        .map(single)?
        .ok_or_else(|| StoreError::WorkerNotFound(worker_id.clone()))?;

        sqlx::query(
            r#"UPDATE jobs
            SET updated_at = ?
            WHERE state = 'processing' AND claimed_by = ?
            "#,
        )
        .bind(millis(now))
        .bind(worker_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(status.into())
    }

    async fn request_stop(&self, worker_id: Option<WorkerId>) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"UPDATE workers
            SET status = 'stopping'
            WHERE status = 'running' AND (?1 IS NULL OR id = ?1)
            "#,
        )
        .bind(worker_id.as_ref().map(WorkerId::as_str))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        result
            .rows_affected()
            .try_into()
            .map_err(|_| StoreError::BadState)
    }

    async fn mark_worker_stopped(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE workers SET status = 'stopped', heartbeat_at = ? WHERE id = ?")
                .bind(millis(now))
                .bind(worker_id.as_str())
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        match result.rows_affected() {
            0 => Err(StoreError::WorkerNotFound(worker_id.clone())),
            _ => Ok(()),
        }
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        sqlx::query_as::<_, types::Worker>("SELECT * FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query("DELETE FROM jobs")
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM workers")
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)
    }
}
