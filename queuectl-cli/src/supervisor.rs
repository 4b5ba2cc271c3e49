//! `worker start` and `worker run`.
//!
//! `worker start` launches `worker run` child processes and waits for them. Each child runs its
//! workers in-process; stop requests reach them through the store, so a plain `worker stop` from
//! another terminal works the same way as Ctrl+C here.
use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use queuectl::{
    store::{JobStore, StoreError},
    Config, Supervisor,
};
use queuectl_sqlx::SqliteStore;
use tokio::process::{Child, Command};

use crate::{data_dir::DataDir, metrics::MetricsFile};

pub(crate) async fn start(data_dir: &DataDir, config: &Config, count: usize) -> anyhow::Result<()> {
    // Opening the store here runs the migrations once, before any child races for them.
    let store = SqliteStore::connect(data_dir.db_path()).await?;
    MetricsFile::mark_started(&data_dir.metrics_path(), Utc::now()).await?;

    let exe = std::env::current_exe().context("Failed to locate the queuectl executable")?;
    let mut children: Vec<Child> = Vec::with_capacity(count);
    for n in 1..=count {
        let spawned = Command::new(&exe)
            .arg("--data-dir")
            .arg(data_dir.root())
            .args(["worker", "run"])
            .spawn();
        match spawned {
            Ok(child) => {
                tracing::info!(pid = child.id(), "Started worker process {n}");
                children.push(child);
            }
            Err(error) => {
                let pids = children.iter().filter_map(Child::id).collect::<Vec<_>>();
                stop_children(&store, &pids).await;
                return Err(error).context("Failed to start a worker process");
            }
        }
    }
    println!("Started {count} worker process(es). Press Ctrl+C to stop.");

    let pids = children.iter().filter_map(Child::id).collect::<Vec<_>>();
    let wait_all = join_all(children.iter_mut().map(|child| child.wait()));
    tokio::pin!(wait_all);

    let statuses = tokio::select! {
        statuses = &mut wait_all => statuses,
        _ = shutdown_signal() => {
            tracing::info!("Stopping worker processes after their current job");
            // Children that have not registered yet only see the request on a later round.
            loop {
                stop_children(&store, &pids).await;
                tokio::select! {
                    statuses = &mut wait_all => break statuses,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
        }
    };

    for (pid, status) in pids.iter().zip(statuses) {
        match status {
            Ok(status) if status.success() => tracing::debug!(pid, "Worker process exited"),
            Ok(status) => tracing::warn!(pid, %status, "Worker process exited with {status}"),
            Err(error) => tracing::error!(pid, ?error, "Failed to wait for worker process"),
        }
    }
    store.close().await;
    println!("Workers stopped.");
    Ok(())
}

async fn stop_children(store: &SqliteStore, pids: &[u32]) {
    let workers = match store.list_workers().await {
        Ok(workers) => workers,
        Err(error) => {
            tracing::warn!(?error, "Failed to list workers: {error}");
            return;
        }
    };
    for worker in workers.into_iter().filter(|worker| pids.contains(&worker.pid)) {
        if let Err(error) = store.request_stop(Some(worker.id.clone())).await {
            tracing::warn!(worker_id = %worker.id, ?error, "Failed to request stop: {error}");
        }
    }
}

pub(crate) async fn run(
    data_dir: &DataDir,
    config: Config,
    name: Option<String>,
    count: usize,
) -> anyhow::Result<()> {
    let path = data_dir.db_path();
    let connected = retry_transient(
        "open the job store",
        config.poll_interval,
        shutdown_signal(),
        || SqliteStore::connect(&path),
    )
    .await?;
    let Some(store) = connected else {
        tracing::info!("Shutdown requested before the job store could be opened");
        return Ok(());
    };
    let hook = Arc::new(MetricsFile::new(data_dir.metrics_path()));

    let mut supervisor = Supervisor::new(store.clone(), config).with_hook(hook);
    if let Some(name) = name {
        supervisor = supervisor.with_name(name);
    }
    // Workers release stale claims before every claim as well.
    if let Err(error) = supervisor.reap_stale_claims().await {
        tracing::warn!(?error, "Failed to release stale claims at start-up: {error}");
    }
    let supervisor = supervisor.spawn(count);
    tracing::info!(
        workers = ?supervisor.worker_ids().collect::<Vec<_>>(),
        "Workers running"
    );

    let token = supervisor.cancellation_token();
    let signal = tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested, finishing current jobs");
        token.cancel();
    });

    let joined = supervisor.join().await;
    signal.abort();
    store.close().await;
    Ok(joined?)
}

/// Retries `operation` every `poll_interval` while it fails with a transient store error.
///
/// Returns `None` if `shutdown` resolves first.
async fn retry_transient<T, F, Fut>(
    what: &str,
    poll_interval: Duration,
    shutdown: impl Future<Output = ()>,
    mut operation: F,
) -> Result<Option<T>, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    tokio::pin!(shutdown);
    loop {
        match operation().await {
            Ok(value) => return Ok(Some(value)),
            Err(error) if error.is_transient() => {
                tracing::warn!(?error, "Failed to {what}, retrying: {error}");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = &mut shutdown => return Ok(None),
                }
            }
            Err(error) => return Err(error),
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(?error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::warn!(?error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
