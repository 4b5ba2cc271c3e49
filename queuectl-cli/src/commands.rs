//! Handlers for the one-shot subcommands.
//!
//! Handlers write their report to `out` so they can be exercised against an in-memory store.
use std::{
    ffi::OsStr,
    io::{BufRead, Write},
    path::Path,
};

use anyhow::{bail, Context};
use chrono::Utc;
use queuectl::{
    job::{Job, JobId, JobState},
    store::{JobStore, StoreError},
    Config,
};
use serde::Deserialize;

use crate::{config::ConfigFile, metrics::Metrics};

/// The JSON accepted by `enqueue`.
#[derive(Debug, Deserialize)]
struct JobRequest {
    id: Option<String>,
    command: String,
    max_retries: Option<u32>,
    backoff_base: Option<u32>,
}

pub(crate) async fn enqueue_json<S: JobStore>(
    store: &S,
    config: &Config,
    json: &str,
    out: &mut impl Write,
) -> anyhow::Result<Job> {
    let request: JobRequest =
        serde_json::from_str(json).context("Invalid job JSON, expected {\"command\": ...}")?;

    let mut builder = Job::builder()
        .with_config(config)
        .with_command(request.command);
    if let Some(id) = request.id {
        builder = builder.with_id(id);
    }
    if let Some(max_retries) = request.max_retries {
        builder = builder.with_max_retries(max_retries);
    }
    if let Some(backoff_base) = request.backoff_base {
        builder = builder.with_backoff_base(backoff_base);
    }
    let job = builder.enqueue(store).await?;
    writeln!(out, "Job '{}' added successfully.", job.id)?;
    Ok(job)
}

/// Copies `script` into `jobs_dir` and enqueues a job running it, named after its file stem.
pub(crate) async fn enqueue_file<S: JobStore>(
    store: &S,
    config: &Config,
    script: &Path,
    jobs_dir: &Path,
    out: &mut impl Write,
) -> anyhow::Result<Job> {
    let (Some(stem), Some(file_name)) = (
        script.file_stem().and_then(OsStr::to_str),
        script.file_name(),
    ) else {
        bail!("Cannot derive a job id from {}", script.display());
    };
    let id = JobId::from(stem);
    // Checked before copying so an existing job's script is never overwritten.
    match store.get(&id).await {
        Ok(_) => bail!("A job with id {id} already exists"),
        Err(StoreError::JobNotFound(_)) => {}
        Err(error) => return Err(error.into()),
    }

    let source = tokio::fs::canonicalize(script)
        .await
        .with_context(|| format!("Failed to read {}", script.display()))?;
    let destination = jobs_dir.join(file_name);
    // Copying a file onto itself would truncate it.
    if tokio::fs::canonicalize(&destination).await.ok().as_ref() != Some(&source) {
        tokio::fs::copy(&source, &destination)
            .await
            .with_context(|| format!("Failed to copy {}", script.display()))?;
    }
    let destination = tokio::fs::canonicalize(&destination).await?;

    let job = Job::builder()
        .with_config(config)
        .with_id(id)
        .with_command(file_command(&destination))
        .enqueue(store)
        .await?;
    writeln!(
        out,
        "Job '{}' added successfully from {}.",
        job.id,
        script.display()
    )?;
    Ok(job)
}

fn file_command(path: &Path) -> String {
    let program = match path.extension().and_then(OsStr::to_str) {
        Some("py") => "python",
        Some("sh") => "bash",
        _ => "cat",
    };
    format!("{program} {}", shell_quote(&path.to_string_lossy()))
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) async fn list<S: JobStore>(
    store: &S,
    state: Option<JobState>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let jobs = store.list(state).await?;
    if jobs.is_empty() {
        writeln!(out, "No jobs found.")?;
        return Ok(());
    }
    match state {
        Some(state) => writeln!(out, "Listing jobs in state {state}:")?,
        None => writeln!(out, "Listing jobs:")?,
    }
    for job in jobs {
        write!(
            out,
            "- {} | {} | attempts={}/{} | command={}",
            job.id, job.state, job.attempts, job.max_retries, job.command
        )?;
        if let Some(next) = job.next_eligible_at.filter(|next| *next > Utc::now()) {
            write!(out, " | next_run={}", next.to_rfc3339())?;
        }
        if let Some(error) = &job.last_error {
            write!(out, " | last_error={error}")?;
        }
        writeln!(out)?;
    }
    Ok(())
}

pub(crate) async fn status<S: JobStore>(store: &S, out: &mut impl Write) -> anyhow::Result<()> {
    let summary = store.summary().await?;
    writeln!(out, "Job Status Summary:")?;
    for (state, count) in summary.iter() {
        writeln!(out, "  {:<12}: {count}", state.as_str())?;
    }
    writeln!(out, "  {:<12}: {}", "total", summary.total())?;

    let workers = store.list_workers().await?;
    writeln!(out, "\nWorkers:")?;
    if workers.is_empty() {
        writeln!(out, "  none")?;
    }
    for worker in workers {
        writeln!(
            out,
            "  {} | pid={} | {} | last_heartbeat={}",
            worker.id,
            worker.pid,
            worker.status,
            worker.heartbeat_at.to_rfc3339()
        )?;
    }
    Ok(())
}

pub(crate) async fn dlq_list<S: JobStore>(store: &S, out: &mut impl Write) -> anyhow::Result<()> {
    let jobs = store.list(Some(JobState::Dead)).await?;
    if jobs.is_empty() {
        writeln!(out, "No jobs in Dead Letter Queue.")?;
        return Ok(());
    }
    writeln!(out, "Dead Letter Queue:")?;
    for job in &jobs {
        writeln!(
            out,
            "- {:<12} | attempts={} | command={} | last_error={}",
            job.id,
            job.attempts,
            job.command,
            job.last_error.as_deref().unwrap_or("-")
        )?;
    }
    writeln!(out, "Total Dead Jobs: {}", jobs.len())?;
    Ok(())
}

pub(crate) async fn dlq_retry<S: JobStore>(
    store: &S,
    id: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let job = store.revive(&JobId::from(id), Utc::now()).await?;
    tracing::info!(job_id = %job.id, "Revived job {} from the dead letter queue", job.id);
    writeln!(out, "Job '{}' moved back to pending queue.", job.id)?;
    Ok(())
}

pub(crate) async fn worker_stop<S: JobStore>(
    store: &S,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let count = store.request_stop(None).await?;
    if count == 0 {
        writeln!(out, "No running workers.")?;
    } else {
        writeln!(out, "Asked {count} worker(s) to stop after their current job.")?;
    }
    Ok(())
}

pub(crate) fn config_show(config: &ConfigFile, out: &mut impl Write) -> anyhow::Result<()> {
    writeln!(out, "Current Configuration:")?;
    for (key, value) in config.entries()? {
        writeln!(out, "  {key}: {value}")?;
    }
    Ok(())
}

pub(crate) fn config_set(
    path: &Path,
    key: &str,
    value: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let mut config = ConfigFile::load(path)?.config;
    config.set(key, value)?;
    config.save(path)?;
    tracing::info!("Config updated: {key} = {value}");
    writeln!(out, "Updated {key} = {value}")?;
    Ok(())
}

pub(crate) async fn metrics<S: JobStore>(
    store: &S,
    metrics_path: &Path,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let metrics = Metrics::load(metrics_path).await;
    let summary = store.summary().await?;
    let rule = "-".repeat(35);

    writeln!(out, "QueueCTL Metrics\n{rule}")?;
    match metrics.last_heartbeat {
        Some(at) => writeln!(out, "Last Heartbeat : {}", at.to_rfc3339())?,
        None => writeln!(out, "Last Heartbeat : N/A")?,
    }
    writeln!(out, "Uptime (s)     : {}", metrics.uptime_seconds)?;
    writeln!(out, "Jobs Completed : {}", metrics.jobs_processed)?;
    writeln!(out, "Failed Jobs    : {}", metrics.failed_jobs)?;
    writeln!(out, "DLQ Jobs       : {}", metrics.dlq_jobs)?;
    writeln!(out, "CPU Usage (%)  : {:.1}", metrics.cpu_usage)?;
    writeln!(out, "Memory (MB)    : {:.2}", metrics.memory_usage)?;
    writeln!(out, "{rule}")?;
    for (state, count) in summary.iter() {
        writeln!(out, "{:<15}: {count}", capitalize(state.as_str()))?;
    }
    writeln!(out, "{rule}")?;
    Ok(())
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub(crate) async fn reset<S: JobStore>(
    store: &S,
    metrics_path: &Path,
    confirmed: bool,
    input: &mut impl BufRead,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    if !confirmed {
        write!(
            out,
            "This deletes every job and worker record and resets the metrics. Continue? [y/N] "
        )?;
        out.flush()?;
        let mut answer = String::new();
        input.read_line(&mut answer)?;
        if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
            writeln!(out, "Aborted.")?;
            return Ok(());
        }
    }

    store.clear().await?;
    Metrics::default().save(metrics_path).await?;
    tracing::info!("Queue reset");
    writeln!(out, "Queue reset.")?;
    Ok(())
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use queuectl::store::{memory::InMemoryStore, NewJob, Transition};

    use super::*;

    fn output(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap()
    }

    async fn dead_job(store: &InMemoryStore, id: &str) {
        let now = Utc::now();
        store
            .insert(
                NewJob {
                    id: id.into(),
                    command: "false".to_owned(),
                    max_retries: 1,
                    backoff_base: 2,
                },
                now,
            )
            .await
            .unwrap();
        let job = store
            .claim_next(&"worker-1".into(), now)
            .await
            .unwrap()
            .unwrap();
        store
            .apply_outcome(Transition {
                id: job.id,
                expected_state: JobState::Processing,
                expected_claimant: Some("worker-1".into()),
                new_state: JobState::Dead,
                attempts: 1,
                next_eligible_at: None,
                last_error: Some("exit status 1".to_owned()),
                result_code: Some(1),
                now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn enqueue_json_applies_defaults() {
        let store = InMemoryStore::new();
        let config = Config {
            max_retries: 5,
            ..Default::default()
        };
        let mut out = Vec::new();

        let job = enqueue_json(
            &store,
            &config,
            r#"{"id": "job1", "command": "sleep 2", "backoff_base": 3}"#,
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(job.id, JobId::from("job1"));
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.backoff_base, 3);
        assert_eq!(output(out), "Job 'job1' added successfully.\n");
    }

    #[tokio::test]
    async fn enqueue_json_generates_missing_id() {
        let store = InMemoryStore::new();

        let job = enqueue_json(
            &store,
            &Config::default(),
            r#"{"command": "echo hi"}"#,
            &mut Vec::new(),
        )
        .await
        .unwrap();

        assert!(!job.id.as_str().is_empty());
        assert_eq!(store.get(&job.id).await.unwrap().command, "echo hi");
    }

    #[tokio::test]
    async fn enqueue_json_rejects_duplicates_and_bad_input() {
        let store = InMemoryStore::new();
        let config = Config::default();
        let json = r#"{"id": "job1", "command": "true"}"#;
        enqueue_json(&store, &config, json, &mut Vec::new())
            .await
            .unwrap();

        let error = enqueue_json(&store, &config, json, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("already exists"));
        assert!(
            enqueue_json(&store, &config, "{not json", &mut Vec::new())
                .await
                .is_err()
        );
        assert!(
            enqueue_json(&store, &config, r#"{"command": "  "}"#, &mut Vec::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn enqueue_file_copies_script() {
        let dir = tempfile::tempdir().unwrap();
        let jobs_dir = dir.path().join("jobs");
        std::fs::create_dir(&jobs_dir).unwrap();
        let script = dir.path().join("task.sh");
        std::fs::write(&script, "echo hello\n").unwrap();
        let store = InMemoryStore::new();

        let job = enqueue_file(&store, &Config::default(), &script, &jobs_dir, &mut Vec::new())
            .await
            .unwrap();

        let copied = jobs_dir.join("task.sh");
        assert_eq!(job.id, JobId::from("task"));
        assert!(job.command.starts_with("bash '"));
        assert!(job.command.ends_with("task.sh'"));
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "echo hello\n");

        let error = enqueue_file(&store, &Config::default(), &script, &jobs_dir, &mut Vec::new())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn enqueue_file_already_in_jobs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("task.sh");
        std::fs::write(&script, "echo hello\n").unwrap();
        let store = InMemoryStore::new();

        let job = enqueue_file(&store, &Config::default(), &script, dir.path(), &mut Vec::new())
            .await
            .unwrap();

        assert_eq!(job.id, JobId::from("task"));
        assert_eq!(std::fs::read_to_string(&script).unwrap(), "echo hello\n");
    }

    #[tokio::test]
    async fn enqueue_file_fails_when_store_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let jobs_dir = dir.path().join("jobs");
        std::fs::create_dir(&jobs_dir).unwrap();
        let script = dir.path().join("task.sh");
        std::fs::write(&script, "echo hello\n").unwrap();
        let store = queuectl_sqlx::SqliteStore::connect(dir.path().join("queue.db"))
            .await
            .unwrap();
        store.close().await;

        let error = enqueue_file(&store, &Config::default(), &script, &jobs_dir, &mut Vec::new())
            .await
            .unwrap_err();

        assert_matches!(
            error.downcast_ref::<StoreError>(),
            Some(StoreError::Unavailable(_))
        );
        assert!(!jobs_dir.join("task.sh").exists());
    }

    #[tokio::test]
    async fn enqueue_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();

        let result = enqueue_file(
            &store,
            &Config::default(),
            &dir.path().join("missing.py"),
            dir.path(),
            &mut Vec::new(),
        )
        .await;

        assert!(result.is_err());
        assert_matches!(store.list(None).await, Ok(jobs) if jobs.is_empty());
    }

    #[test]
    fn file_command_by_extension() {
        assert_eq!(file_command(Path::new("/data/jobs/a.py")), "python '/data/jobs/a.py'");
        assert_eq!(file_command(Path::new("/data/jobs/a.sh")), "bash '/data/jobs/a.sh'");
        assert_eq!(file_command(Path::new("/data/jobs/a.txt")), "cat '/data/jobs/a.txt'");
        assert_eq!(
            file_command(Path::new("/data/it's.sh")),
            r"bash '/data/it'\''s.sh'"
        );
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let store = InMemoryStore::new();
        dead_job(&store, "dead").await;
        enqueue_json(
            &store,
            &Config::default(),
            r#"{"id": "fresh", "command": "true"}"#,
            &mut Vec::new(),
        )
        .await
        .unwrap();
        let mut out = Vec::new();

        list(&store, Some(JobState::Pending), &mut out).await.unwrap();

        let out = output(out);
        assert!(out.contains("- fresh | pending | attempts=0/3 | command=true"));
        assert!(!out.contains("dead"));
    }

    #[tokio::test]
    async fn list_empty() {
        let mut out = Vec::new();

        list(&InMemoryStore::new(), None, &mut out).await.unwrap();

        assert_eq!(output(out), "No jobs found.\n");
    }

    #[tokio::test]
    async fn dlq_list_and_retry() {
        let store = InMemoryStore::new();
        dead_job(&store, "job1").await;
        let mut out = Vec::new();

        dlq_list(&store, &mut out).await.unwrap();
        dlq_retry(&store, "job1", &mut out).await.unwrap();

        let out = output(out);
        assert!(out.contains("last_error=exit status 1"));
        assert!(out.contains("Total Dead Jobs: 1"));
        assert!(out.contains("Job 'job1' moved back to pending queue."));
        let job = store.get(&"job1".into()).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn dlq_retry_requires_dead_job() {
        let store = InMemoryStore::new();

        let error = dlq_retry(&store, "missing", &mut Vec::new())
            .await
            .unwrap_err();

        assert_matches!(
            error.downcast_ref::<StoreError>(),
            Some(StoreError::JobNotFound(_))
        );
    }

    #[tokio::test]
    async fn status_reports_counts_and_workers() {
        let store = InMemoryStore::new();
        dead_job(&store, "job1").await;
        let mut out = Vec::new();

        status(&store, &mut out).await.unwrap();

        let out = output(out);
        assert!(out.contains("dead        : 1"));
        assert!(out.contains("total       : 1"));
        assert!(out.contains("none"));
    }

    #[tokio::test]
    async fn metrics_reports_snapshot_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let metrics_path = dir.path().join("metrics.json");
        Metrics {
            jobs_processed: 2,
            cpu_usage: 12.5,
            memory_usage: 40.25,
            ..Metrics::default()
        }
        .save(&metrics_path)
        .await
        .unwrap();
        let store = InMemoryStore::new();
        dead_job(&store, "job1").await;
        let mut out = Vec::new();

        metrics(&store, &metrics_path, &mut out).await.unwrap();

        let out = output(out);
        assert!(out.contains("Last Heartbeat : N/A"));
        assert!(out.contains("Jobs Completed : 2"));
        assert!(out.contains("CPU Usage (%)  : 12.5"));
        assert!(out.contains("Memory (MB)    : 40.25"));
        assert!(out.contains("Dead           : 1"));
    }

    #[tokio::test]
    async fn reset_asks_for_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let metrics_path = dir.path().join("metrics.json");
        let store = InMemoryStore::new();
        dead_job(&store, "job1").await;

        let mut out = Vec::new();
        reset(&store, &metrics_path, false, &mut "n\n".as_bytes(), &mut out)
            .await
            .unwrap();
        assert!(output(out).ends_with("Aborted.\n"));
        assert_eq!(store.summary().await.unwrap().total(), 1);

        Metrics {
            jobs_processed: 3,
            cpu_usage: 12.5,
            memory_usage: 40.0,
            ..Metrics::default()
        }
        .save(&metrics_path)
        .await
        .unwrap();
        reset(&store, &metrics_path, false, &mut "y\n".as_bytes(), &mut Vec::new())
            .await
            .unwrap();
        assert_eq!(store.summary().await.unwrap().total(), 0);
        assert_eq!(Metrics::load(&metrics_path).await, Metrics::default());
    }

    #[test]
    fn config_set_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut out = Vec::new();

        config_set(&path, "max_retries", "7", &mut out).unwrap();
        config_show(&ConfigFile::load(&path).unwrap().config, &mut out).unwrap();

        let out = output(out);
        assert!(out.contains("Updated max_retries = 7"));
        assert!(out.contains("  max_retries: 7"));
        assert!(config_set(&path, "unknown", "1", &mut Vec::new()).is_err());
    }
}
