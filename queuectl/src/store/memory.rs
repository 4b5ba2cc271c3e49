//! Provides an in memory implementation of [`JobStore`].
//!
//! All state lives behind a single lock, so every operation is trivially atomic within one
//! process. It cannot be shared between processes; use the SQLite store for that.
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{Job, JobId, JobState, WorkerId};

use super::{
    JobStore, NewJob, StateSummary, StoreError, Transition, WorkerRecord, WorkerStatus,
};

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<JobId, Job>,
    workers: BTreeMap<WorkerId, WorkerRecord>,
}

/// An in memory implementation of [`JobStore`].
///
/// Cloning is cheap and clones share the same underlying jobs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    /// Creates a new, empty instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::BadState)
    }
}

impl Job {
    fn mark_processing(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.claimed_by = Some(worker_id.clone());
        self.updated_at = now;
    }

    fn apply(&mut self, transition: Transition) {
        self.claimed_by = transition.claimed_by();
        self.state = transition.new_state;
        self.attempts = transition.attempts;
        self.next_eligible_at = transition.next_eligible_at;
        self.last_error = transition.last_error;
        self.result_code = transition.result_code;
        self.updated_at = transition.now;
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.claimed_by = None;
        self.updated_at = now;
    }

    fn revive(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.attempts = 0;
        self.next_eligible_at = None;
        self.claimed_by = None;
        self.updated_at = now;
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        let job = job.into_job(now);
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        self.read()?
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))
    }

    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self
            .read()?
            .jobs
            .values()
            .filter(|job| state.map_or(true, |state| job.state == state))
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.write()?;
        let next = inner
            .jobs
            .values_mut()
            .filter(|job| job.is_eligible(now))
            .min_by(|a, b| a.ready_at().cmp(&b.ready_at()).then(a.id.cmp(&b.id)));
        Ok(next.map(|job| {
            job.mark_processing(worker_id, now);
            job.clone()
        }))
    }

    async fn apply_outcome(&self, transition: Transition) -> Result<Job, StoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(&transition.id)
            .ok_or_else(|| StoreError::JobNotFound(transition.id.clone()))?;
        if job.state != transition.expected_state || job.claimed_by != transition.expected_claimant
        {
            return Err(StoreError::StaleWrite {
                id: transition.id,
                expected: transition.expected_state,
            });
        }
        job.apply(transition);
        Ok(job.clone())
    }

    async fn release_stale_claims(
        &self,
        timeout: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let mut inner = self.write()?;
        Ok(inner
            .jobs
            .values_mut()
            .filter(|job| job.state == JobState::Processing && now - job.updated_at > timeout)
            .map(|job| {
                job.release(now);
                job.id.clone()
            })
            .collect())
    }

    async fn revive(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut inner = self.write()?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))?;
        if job.state != JobState::Dead {
            return Err(StoreError::InvalidState {
                id: id.clone(),
                actual: job.state,
                required: JobState::Dead,
            });
        }
        job.revive(now);
        Ok(job.clone())
    }

    async fn summary(&self) -> Result<StateSummary, StoreError> {
        Ok(self.read()?.jobs.values().map(|job| job.state).collect())
    }

    async fn register_worker(&self, record: WorkerRecord) -> Result<Vec<JobId>, StoreError> {
        let mut inner = self.write()?;
        let released = inner
            .jobs
            .values_mut()
            .filter(|job| {
                job.state == JobState::Processing && job.claimed_by.as_ref() == Some(&record.id)
            })
            .map(|job| {
                job.release(record.started_at);
                job.id.clone()
            })
            .collect();
        inner.workers.insert(record.id.clone(), record);
        Ok(released)
    }

    async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<WorkerStatus, StoreError> {
        let mut inner = self.write()?;
        let record = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.clone()))?;
        record.heartbeat_at = now;
        let status = record.status;
        inner
            .jobs
            .values_mut()
            .filter(|job| {
                job.state == JobState::Processing && job.claimed_by.as_ref() == Some(worker_id)
            })
            .for_each(|job| job.updated_at = now);
        Ok(status)
    }

    async fn request_stop(&self, worker_id: Option<WorkerId>) -> Result<usize, StoreError> {
        Ok(self
            .write()?
            .workers
            .values_mut()
            .filter(|record| record.status == WorkerStatus::Running)
            .filter(|record| worker_id.as_ref().map_or(true, |id| &record.id == id))
            .map(|record| record.status = WorkerStatus::Stopping)
            .count())
    }

    async fn mark_worker_stopped(
        &self,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let record = inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| StoreError::WorkerNotFound(worker_id.clone()))?;
        record.status = WorkerStatus::Stopped;
        record.heartbeat_at = now;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self.read()?.workers.values().cloned().collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.jobs.clear();
        inner.workers.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    crate::store_test_suite!(for: InMemoryStore::new());

    #[tokio::test]
    async fn clones_share_jobs() {
        let store = InMemoryStore::new();
        let clone = store.clone();
        let job = NewJob {
            id: "shared".into(),
            command: "true".to_owned(),
            max_retries: 3,
            backoff_base: 2,
        };

        store.insert(job, Utc::now()).await.unwrap();

        assert!(clone.get(&"shared".into()).await.is_ok());
    }

    #[tokio::test]
    async fn badstate_errors() {
        let store = InMemoryStore::new();
        let worker_id = WorkerId::from("worker");

        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.inner.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(store.list(None).await, Err(StoreError::BadState));
        assert_matches!(
            store.claim_next(&worker_id, Utc::now()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            store.release_stale_claims(TimeDelta::seconds(1), Utc::now()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.summary().await, Err(StoreError::BadState));
    }
}
