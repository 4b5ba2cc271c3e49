//! The `metrics.json` snapshot.
//!
//! Every worker process updates the same file with a read-modify-write, so concurrent updates
//! from different processes may overwrite each other; the last writer wins.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl::{
    hook::{OutcomeEvent, OutcomeHook},
    job::WorkerId,
    policy::Resolution,
};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct Metrics {
    pub(crate) last_heartbeat: Option<DateTime<Utc>>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) uptime_seconds: i64,
    /// Executions that completed successfully.
    pub(crate) jobs_processed: u64,
    /// Failed executions, whether or not they will be retried.
    pub(crate) failed_jobs: u64,
    pub(crate) dlq_jobs: u64,
    /// System-wide CPU usage in percent, sampled at the last heartbeat.
    pub(crate) cpu_usage: f64,
    /// Resident memory of the heartbeating worker process, in MB.
    pub(crate) memory_usage: f64,
}

impl Metrics {
    /// Reads the snapshot, treating a missing or unreadable file as empty.
    pub(crate) async fn load(path: &Path) -> Self {
        match tokio::fs::read(path).await {
            Ok(contents) => serde_json::from_slice(&contents).unwrap_or_else(|error| {
                tracing::warn!(?error, "Ignoring malformed metrics file {}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Writes through a temporary file so readers never observe a partial snapshot.
    pub(crate) async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Completed => self.jobs_processed += 1,
            Resolution::Retrying => self.failed_jobs += 1,
            Resolution::Dead => {
                self.failed_jobs += 1;
                self.dlq_jobs += 1;
            }
        }
    }

    fn sample(&mut self, system: &mut System) {
        // Global CPU usage is measured against the previous refresh of the same `System`.
        system.refresh_cpu();
        self.cpu_usage = f64::from(system.global_cpu_info().cpu_usage());
        if let Ok(pid) = sysinfo::get_current_pid() {
            system.refresh_process(pid);
            if let Some(process) = system.process(pid) {
                self.memory_usage = process.memory() as f64 / (1024.0 * 1024.0);
            }
        }
    }

    fn touch(&mut self, now: DateTime<Utc>, fallback_start: DateTime<Utc>) {
        let started_at = *self.started_at.get_or_insert(fallback_start);
        self.uptime_seconds = (now - started_at).num_seconds().max(0);
    }
}

/// An [`OutcomeHook`] maintaining [`Metrics`] in a file.
pub(crate) struct MetricsFile {
    path: PathBuf,
    started_at: DateTime<Utc>,
    system: Mutex<System>,
}

impl MetricsFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            started_at: Utc::now(),
            system: Mutex::new(System::new()),
        }
    }

    /// Resets the uptime clock, keeping the counters.
    pub(crate) async fn mark_started(path: &Path, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut metrics = Metrics::load(path).await;
        metrics.started_at = Some(now);
        metrics.uptime_seconds = 0;
        metrics.save(path).await
    }

    async fn update(&self, now: DateTime<Utc>, update: impl FnOnce(&mut Metrics, &mut System)) {
        let mut system = self.system.lock().await;
        let mut metrics = Metrics::load(&self.path).await;
        update(&mut metrics, &mut system);
        metrics.touch(now, self.started_at);
        let _ = metrics.save(&self.path).await.inspect_err(|error| {
            tracing::warn!(?error, "Failed to write metrics to {}", self.path.display())
        });
    }
}

#[async_trait]
impl OutcomeHook for MetricsFile {
    async fn outcome_applied(&self, event: &OutcomeEvent) {
        self.update(Utc::now(), |metrics, _| metrics.record(event.resolution))
            .await;
    }

    async fn heartbeat(&self, _worker_id: &WorkerId, at: DateTime<Utc>) {
        self.update(at, |metrics, system| {
            metrics.last_heartbeat = Some(at);
            metrics.sample(system);
        })
        .await;
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use queuectl::{
        job::{Job, JobState},
        store::NewJob,
    };

    use super::*;

    fn event(resolution: Resolution) -> OutcomeEvent {
        let job = NewJob {
            id: "job".into(),
            command: "true".to_owned(),
            max_retries: 3,
            backoff_base: 2,
        }
        .into_job(Utc::now());
        OutcomeEvent {
            worker_id: "worker-1".into(),
            resolution,
            job: Job {
                state: JobState::Completed,
                ..job
            },
        }
    }

    #[tokio::test]
    async fn counts_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let hook = MetricsFile::new(&path);

        hook.outcome_applied(&event(Resolution::Completed)).await;
        hook.outcome_applied(&event(Resolution::Completed)).await;
        hook.outcome_applied(&event(Resolution::Retrying)).await;
        hook.outcome_applied(&event(Resolution::Dead)).await;

        let metrics = Metrics::load(&path).await;
        assert_eq!(metrics.jobs_processed, 2);
        assert_eq!(metrics.failed_jobs, 2);
        assert_eq!(metrics.dlq_jobs, 1);
        assert!(metrics.started_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_updates_uptime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let started = Utc::now() - TimeDelta::seconds(30);
        MetricsFile::mark_started(&path, started).await.unwrap();
        let hook = MetricsFile::new(&path);
        let now = Utc::now();

        hook.heartbeat(&"worker-1".into(), now).await;

        let metrics = Metrics::load(&path).await;
        assert_eq!(metrics.last_heartbeat, Some(now));
        assert_eq!(metrics.started_at, Some(started));
        assert!(metrics.uptime_seconds >= 30);
        assert!(metrics.memory_usage > 0.0);
        assert!(metrics.cpu_usage >= 0.0);
    }

    #[tokio::test]
    async fn outcomes_keep_last_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let hook = MetricsFile::new(&path);

        hook.heartbeat(&"worker-1".into(), Utc::now()).await;
        let sampled = Metrics::load(&path).await.memory_usage;
        hook.outcome_applied(&event(Resolution::Completed)).await;

        let metrics = Metrics::load(&path).await;
        assert_eq!(metrics.memory_usage, sampled);
        assert_eq!(metrics.jobs_processed, 1);
    }

    #[tokio::test]
    async fn malformed_file_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "[]").unwrap();

        assert_eq!(Metrics::load(&path).await, Metrics::default());
    }
}
