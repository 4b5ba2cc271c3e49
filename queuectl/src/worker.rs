//! A single worker loop.
//!
//! Each iteration the worker heartbeats, returns abandoned claims to the queue, claims the next
//! eligible job, executes it and writes the outcome back through the retry policy. Shutdown is
//! only observed between jobs: a job that has been claimed always runs to completion and has its
//! outcome recorded.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::Config,
    executor::{ExecutionResult, Executor, ShellExecutor},
    hook::{NoopHook, OutcomeEvent, OutcomeHook},
    job::{Job, WorkerId},
    policy::{self, Resolution},
    store::{JobStore, StoreError, Transition, WorkerRecord, WorkerStatus},
};

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// What a single iteration of the worker loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// No job was eligible.
    Idle,
    /// A job was executed and its outcome recorded.
    Resolved(Resolution),
    /// A job was executed but another party had taken it over, so the outcome was dropped.
    Discarded,
}

pub struct Worker<S> {
    id: WorkerId,
    store: S,
    config: Config,
    executor: Arc<dyn Executor>,
    hook: Arc<dyn OutcomeHook>,
}

impl<S> Worker<S>
where
    S: JobStore,
{
    pub fn new(id: impl Into<WorkerId>, store: S, config: Config) -> Self {
        let executor = ShellExecutor::new().with_timeout(config.job_timeout);
        Self {
            id: id.into(),
            store,
            config,
            executor: Arc::new(executor),
            hook: Arc::new(NoopHook),
        }
    }

    pub fn with_executor(self, executor: Arc<dyn Executor>) -> Self {
        Self { executor, ..self }
    }

    pub fn with_hook(self, hook: Arc<dyn OutcomeHook>) -> Self {
        Self { hook, ..self }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Runs the loop until `shutdown` is cancelled or a stop is requested through the store.
    #[instrument(skip_all, fields(worker_id = %self.id))]
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.register(&shutdown).await {
            return;
        }
        tracing::info!("Worker {} started", self.id);

        while !shutdown.is_cancelled() {
            if let Some(status @ (WorkerStatus::Stopping | WorkerStatus::Stopped)) =
                self.beat().await
            {
                tracing::info!("Worker {} is {status}, shutting down", self.id);
                break;
            }
            match self.tick(&shutdown).await {
                Ok(Tick::Resolved(_) | Tick::Discarded) => {}
                Ok(Tick::Idle) => self.idle(&shutdown).await,
                Err(error) => {
                    tracing::error!(?error, "Worker {} failed to process jobs: {error}", self.id);
                    self.idle(&shutdown).await;
                }
            }
        }

        let _ = self
            .store
            .mark_worker_stopped(&self.id, Utc::now())
            .await
            .inspect_err(|error| {
                tracing::warn!(?error, "Failed to mark worker {} as stopped: {error}", self.id)
            });
        tracing::info!("Worker {} stopped", self.id);
    }

    /// Runs one claim, execute, resolve cycle.
    ///
    /// Store failures before a job is claimed are returned. Once a job has been executed its
    /// outcome is retried while the store is unavailable, until it is written or `shutdown` is
    /// cancelled.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Result<Tick, StoreError> {
        self.release_stale_claims().await?;

        let Some(job) = self.store.claim_next(&self.id, Utc::now()).await? else {
            return Ok(Tick::Idle);
        };
        tracing::info!(
            job_id = %job.id,
            "Claimed job {}, attempt {} of {}",
            job.id,
            job.attempts.saturating_add(1),
            job.max_retries
        );

        let result = self.execute(&job).await;
        let (resolution, transition) = policy::resolve(&job, &result, Utc::now());
        self.apply(resolution, transition, shutdown).await
    }

    async fn register(&self, shutdown: &CancellationToken) -> bool {
        loop {
            let record = WorkerRecord::new(self.id.clone(), Utc::now());
            match self.store.register_worker(record).await {
                Ok(released) => {
                    for job_id in released {
                        tracing::warn!(
                            %job_id,
                            "Released job {job_id} left behind by a previous run of worker {}",
                            self.id
                        );
                    }
                    return true;
                }
                Err(error) => {
                    tracing::error!(?error, "Failed to register worker {}: {error}", self.id);
                    self.idle(shutdown).await;
                    if shutdown.is_cancelled() {
                        return false;
                    }
                }
            }
        }
    }

    /// Heartbeats, returning the worker's status if the store could be reached.
    async fn beat(&self) -> Option<WorkerStatus> {
        let now = Utc::now();
        match self.store.heartbeat(&self.id, now).await {
            Ok(status) => {
                self.hook.heartbeat(&self.id, now).await;
                Some(status)
            }
            Err(StoreError::WorkerNotFound(_)) => {
                tracing::warn!("Worker {} record missing, registering again", self.id);
                let _ = self
                    .store
                    .register_worker(WorkerRecord::new(self.id.clone(), now))
                    .await
                    .inspect_err(|error| {
                        tracing::error!(?error, "Failed to register worker {}: {error}", self.id)
                    });
                None
            }
            Err(error) => {
                tracing::warn!(?error, "Worker {} failed to heartbeat: {error}", self.id);
                None
            }
        }
    }

    async fn release_stale_claims(&self) -> Result<(), StoreError> {
        let released = self
            .store
            .release_stale_claims(self.config.lease_timeout_delta(), Utc::now())
            .await?;
        for job_id in released {
            tracing::warn!(%job_id, "Released abandoned claim on job {job_id}");
        }
        Ok(())
    }

    /// Executes the job, heartbeating while it runs so its lease stays fresh.
    async fn execute(&self, job: &Job) -> ExecutionResult {
        let execution = self.executor.execute(job);
        tokio::pin!(execution);

        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut execution => return result,
                _ = heartbeat.tick() => {
                    self.beat().await;
                }
            }
        }
    }

    async fn apply(
        &self,
        resolution: Resolution,
        transition: Transition,
        shutdown: &CancellationToken,
    ) -> Result<Tick, StoreError> {
        let job_id = transition.id.clone();
        loop {
            match self.store.apply_outcome(transition.clone()).await {
                Ok(job) => {
                    log_outcome(resolution, &job);
                    let event = OutcomeEvent {
                        worker_id: self.id.clone(),
                        resolution,
                        job,
                    };
                    self.hook.outcome_applied(&event).await;
                    return Ok(Tick::Resolved(resolution));
                }
                Err(error @ StoreError::StaleWrite { .. }) => {
                    tracing::warn!(
                        %job_id,
                        ?error,
                        "Discarding outcome of job {job_id}, it was taken over by another worker"
                    );
                    return Ok(Tick::Discarded);
                }
                Err(error) if error.is_transient() && !shutdown.is_cancelled() => {
                    tracing::warn!(
                        %job_id,
                        ?error,
                        "Failed to record outcome of job {job_id}, retrying: {error}"
                    );
                    self.idle(shutdown).await;
                }
                Err(error) => {
                    tracing::error!(
                        %job_id,
                        ?error,
                        "Failed to record outcome of job {job_id}: {error}"
                    );
                    return Err(error);
                }
            }
        }
    }

    async fn idle(&self, shutdown: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.cancelled() => {}
        }
    }
}

fn log_outcome(resolution: Resolution, job: &Job) {
    let job_id = &job.id;
    let error = job.last_error.as_deref().unwrap_or_default();
    match resolution {
        Resolution::Completed => tracing::info!(%job_id, "Job {job_id} completed"),
        Resolution::Retrying => tracing::warn!(
            %job_id,
            attempts = job.attempts,
            "Job {job_id} failed and will be retried at {}: {error}",
            job.ready_at()
        ),
        Resolution::Dead => tracing::error!(
            %job_id,
            attempts = job.attempts,
            "Job {job_id} failed after {} attempts and was moved to the dead letter queue: {error}",
            job.attempts
        ),
    }
}
