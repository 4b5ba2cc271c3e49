//! A [`JobStore`](queuectl::store::JobStore) backed by a single SQLite database file.
//!
//! The database is opened in WAL mode so that any number of processes can share it: every
//! worker process opens its own [`SqliteStore`] on the same path. Claims are a single
//! `UPDATE ... RETURNING` statement, which SQLite serializes against all other writers.
use std::{ops::Deref, path::Path, time::Duration};

use queuectl::store::StoreError;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};

mod query;
mod store;
mod types;

/// Applies the schema in `migrations/`.
pub static MIGRATOR: Migrator = sqlx::migrate!();

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 4;

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl Deref for SqliteStore {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl SqliteStore {
    /// Opens, creating if needed, the database at `path` and brings its schema up to date.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, running any pending migrations on it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await.map_err(|error| {
            tracing::error!(?error, "Failed to migrate job store: {error}");
            StoreError::Unavailable(Box::new(error))
        })?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Decoding failures map to [`StoreError::BadState`]; anything else is
/// [`StoreError::Unavailable`].
pub(crate) fn map_err(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => {
            tracing::error!(?error, "Job store returned malformed data: {error}");
            StoreError::BadState
        }
        error => StoreError::Unavailable(Box::new(error)),
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use chrono::Utc;
    use queuectl::{
        job::{JobId, JobState, WorkerId},
        store::{JobStore, NewJob},
    };

    use super::*;

    async fn store() -> SqliteStore {
        let dir = tempfile::tempdir().unwrap().into_path();
        SqliteStore::connect(dir.join("queue.db")).await.unwrap()
    }

    queuectl::store_test_suite!(attr: tokio::test, args: (), store: store().await);

    fn new_job(id: &str) -> NewJob {
        NewJob {
            id: id.into(),
            command: "true".to_owned(),
            max_retries: 3,
            backoff_base: 2,
        }
    }

    #[tokio::test]
    async fn jobs_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let store = SqliteStore::connect(&path).await.unwrap();
        let inserted = store.insert(new_job("durable"), Utc::now()).await.unwrap();
        store.close().await;

        let store = SqliteStore::connect(&path).await.unwrap();

        assert_eq!(store.get(&"durable".into()).await.unwrap(), inserted);
    }

    #[tokio::test]
    async fn malformed_row_is_bad_state() {
        let store = store().await;
        store.insert(new_job("broken"), Utc::now()).await.unwrap();
        sqlx::query("UPDATE jobs SET attempts = -1")
            .execute(&*store)
            .await
            .unwrap();

        assert_matches!(
            store.get(&"broken".into()).await,
            Err(StoreError::BadState)
        );
    }

    #[tokio::test]
    async fn closed_pool_is_unavailable() {
        let store = store().await;
        store.close().await;

        let result = store.list(None).await;

        assert_matches!(result, Err(error) if error.is_transient());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writes_are_visible_to_the_next_read() {
        let store = store().await;
        let worker_id = WorkerId::from("worker-1");

        for i in 0..200 {
            let id = JobId::from(format!("job-{i:03}"));
            let inserted = store.insert(new_job(id.as_str()), Utc::now()).await.unwrap();
            assert_eq!(store.get(&id).await.unwrap(), inserted);

            let claimed = store
                .claim_next(&worker_id, Utc::now())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.id, id);
            assert_eq!(store.get(&id).await.unwrap(), claimed);

            let (_, transition) = queuectl::policy::resolve(
                &claimed,
                &queuectl::executor::ExecutionResult::Done,
                Utc::now(),
            );
            let completed = store.apply_outcome(transition).await.unwrap();
            assert_eq!(store.get(&id).await.unwrap(), completed);
            assert_eq!(completed.state, JobState::Completed);
        }
        assert_eq!(store.summary().await.unwrap().get(JobState::Completed), 200);
    }

    /// Each store has its own pool, standing in for separate worker processes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_across_pools() {
        const JOBS: usize = 50;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let seed = SqliteStore::connect(&path).await.unwrap();
        for i in 0..JOBS {
            seed.insert(new_job(&format!("job-{i:02}")), Utc::now())
                .await
                .unwrap();
        }

        let mut handles = vec![];
        for i in 0..4 {
            let store = SqliteStore::connect(&path).await.unwrap();
            handles.push(tokio::spawn(async move {
                let worker_id = WorkerId::from(format!("worker-{i}"));
                let mut claimed = vec![];
                loop {
                    match store.claim_next(&worker_id, Utc::now()).await {
                        Ok(Some(job)) => claimed.push(job.id),
                        Ok(None) => break,
                        // Lock contention beyond the busy timeout; try again.
                        Err(error) if error.is_transient() => continue,
                        Err(error) => panic!("{error}"),
                    }
                }
                claimed
            }));
        }
        let mut claimed: Vec<JobId> = vec![];
        for handle in handles {
            claimed.extend(handle.await.unwrap());
        }

        let unique = claimed.iter().collect::<HashSet<_>>();
        assert_eq!(claimed.len(), JOBS);
        assert_eq!(unique.len(), JOBS);
        let summary = seed.summary().await.unwrap();
        assert_eq!(summary.get(JobState::Processing), JOBS as u64);
    }
}
