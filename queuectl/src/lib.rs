//! A local background job queue.
//!
//! Jobs are shell commands persisted in a [`JobStore`](store::JobStore). A pool of workers, in
//! this process or in others sharing the same store, claim eligible jobs one at a time, run them
//! and record the outcome. Failed jobs are retried with exponential backoff until they exhaust
//! their `max_retries`, at which point they are moved to the dead letter queue where they can be
//! inspected and revived.
//!
//! # Setting up workers
//!
//! ```
//! # use queuectl::prelude::*;
//! # use queuectl::store::memory::InMemoryStore;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = InMemoryStore::new();
//!
//! Job::builder()
//!     .with_id("hello")
//!     .with_command("echo hello")
//!     .enqueue(&store)
//!     .await
//!     .unwrap();
//!
//! let supervisor = Supervisor::new(store, Config::default()).spawn(2);
//!
//! // Workers finish the job they are running before returning.
//! supervisor.graceful_shutdown().await.unwrap();
//! # }
//! ```
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod backoff;
mod config;
pub mod executor;
pub mod hook;
pub mod job;
pub mod policy;
pub mod prelude;
pub mod store;
pub mod worker;

pub use config::Config;

use executor::{Executor, ShellExecutor};
use hook::{NoopHook, OutcomeHook};
use job::{JobId, WorkerId};
use store::{JobStore, StoreError};
use worker::Worker;

/// Runs a pool of workers against a shared store.
pub struct Supervisor<S> {
    name: String,
    store: S,
    config: Config,
    executor: Arc<dyn Executor>,
    hook: Arc<dyn OutcomeHook>,
    workers: Vec<WorkerHandle>,
    cancellation_token: CancellationToken,
}

#[derive(Debug)]
struct WorkerHandle {
    id: WorkerId,
    handle: JoinHandle<()>,
}

impl<S> Supervisor<S>
where
    S: JobStore + Clone + 'static,
{
    pub fn new(store: S, config: Config) -> Self {
        let executor = ShellExecutor::new().with_timeout(config.job_timeout);
        Self {
            name: format!("worker-{}", std::process::id()),
            store,
            config,
            executor: Arc::new(executor),
            hook: Arc::new(NoopHook),
            workers: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Prefix for the ids of the spawned workers, which are named `{name}-{n}`.
    ///
    /// Defaults to `worker-{pid}` so that workers of different processes never collide.
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn with_executor(self, executor: Arc<dyn Executor>) -> Self {
        Self { executor, ..self }
    }

    pub fn with_hook(self, hook: Arc<dyn OutcomeHook>) -> Self {
        Self { hook, ..self }
    }

    /// Spawns `count` more worker loops onto the tokio runtime.
    pub fn spawn(mut self, count: usize) -> Self {
        for _ in 0..count {
            let id = WorkerId::from(format!("{}-{}", self.name, self.workers.len() + 1));
            let worker = Worker::new(id.clone(), self.store.clone(), self.config.clone())
                .with_executor(self.executor.clone())
                .with_hook(self.hook.clone());
            let handle = tokio::spawn({
                let shutdown = self.cancellation_token.clone();
                async move { worker.run(shutdown).await }
            });
            tracing::debug!("Spawned worker {id}");
            self.workers.push(WorkerHandle { id, handle });
        }
        self
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = &WorkerId> {
        self.workers.iter().map(|worker| &worker.id)
    }

    /// Cancelling the returned token stops every worker after its current job.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Returns `processing` jobs whose lease has expired to the queue.
    ///
    /// Workers do this on every iteration; calling it once before spawning recovers jobs
    /// abandoned by a previous crash straight away.
    pub async fn reap_stale_claims(&self) -> Result<Vec<JobId>, QueueError> {
        let released = self
            .store
            .release_stale_claims(self.config.lease_timeout_delta(), Utc::now())
            .await?;
        if !released.is_empty() {
            tracing::warn!(
                count = released.len(),
                "Released {} abandoned claims",
                released.len()
            );
        }
        Ok(released)
    }

    /// Waits for every worker to exit, either through the cancellation token or because a stop
    /// was requested through the store.
    pub async fn join(self) -> Result<(), QueueError> {
        futures::future::join_all(self.workers.into_iter().map(|worker| async move {
            worker.handle.await.map_err(|error| {
                tracing::error!(?error, "Worker {} exited abnormally: {error}", worker.id);
                QueueError::GracefulShutdownFailed
            })
        }))
        .await
        .into_iter()
        .collect()
    }

    pub async fn graceful_shutdown(self) -> Result<(), QueueError> {
        tracing::debug!("Shutting down {} workers", self.workers.len());
        self.cancellation_token.cancel();
        self.join().await
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Invalid job: {0}")]
    InvalidJob(&'static str),
}
