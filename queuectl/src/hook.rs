use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    job::{Job, WorkerId},
    policy::Resolution,
};

/// Emitted after a worker has successfully written the outcome of an execution to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub worker_id: WorkerId,
    pub resolution: Resolution,
    pub job: Job,
}

/// Receives engine events, e.g. to maintain a metrics snapshot.
///
/// Hooks are write-only from the engine's point of view: they cannot fail and their effects are
/// never read back by the worker loop.
#[async_trait]
pub trait OutcomeHook: Send + Sync {
    async fn outcome_applied(&self, event: &OutcomeEvent);

    async fn heartbeat(&self, _worker_id: &WorkerId, _at: DateTime<Utc>) {}
}

/// A hook that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

#[async_trait]
impl OutcomeHook for NoopHook {
    async fn outcome_applied(&self, _event: &OutcomeEvent) {}
}

