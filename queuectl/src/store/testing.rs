//! Test suite for ensuring a correct implementation of a job store.
use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    executor::{ErrorType, ExecutionError, ExecutionResult},
    job::{Job, JobId, JobState, WorkerId},
    policy::{self, Resolution},
};

use super::{JobStore, NewJob, StoreError, Transition, WorkerRecord, WorkerStatus};

const WORKER: &str = "worker-1";
const OTHER_WORKER: &str = "worker-2";

/// Create test suite for a job store.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use queuectl::store_test_suite;
/// use queuectl::store::memory::InMemoryStore;
/// store_test_suite!(for: InMemoryStore::new());
/// ```
///
/// If the store needs async setup, or a different test attribute, the long form can be used:
///
/// ```ignore
/// use queuectl::store_test_suite;
/// store_test_suite!(
///     attr: tokio::test,
///     args: (),
///     store: SqliteStore::connect(path).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn insert_and_get $args {
          let store = $store;
          $crate::store::testing::insert_and_get(store).await;
        }
        #[$attr]
        async fn insert_duplicate_id $args {
          let store = $store;
          $crate::store::testing::insert_duplicate_id(store).await;
        }
        #[$attr]
        async fn get_not_found $args {
          let store = $store;
          $crate::store::testing::get_not_found(store).await;
        }
        #[$attr]
        async fn list_filters_by_state $args {
          let store = $store;
          $crate::store::testing::list_filters_by_state(store).await;
        }
        #[$attr]
        async fn claim_next_empty $args {
          let store = $store;
          $crate::store::testing::claim_next_empty(store).await;
        }
        #[$attr]
        async fn claim_next_marks_processing $args {
          let store = $store;
          $crate::store::testing::claim_next_marks_processing(store).await;
        }
        #[$attr]
        async fn claim_next_in_ready_order $args {
          let store = $store;
          $crate::store::testing::claim_next_in_ready_order(store).await;
        }
        #[$attr]
        async fn claim_next_skips_ineligible_jobs $args {
          let store = $store;
          $crate::store::testing::claim_next_skips_ineligible_jobs(store).await;
        }
        #[$attr]
        async fn claim_next_concurrently $args {
          let store = $store;
          $crate::store::testing::claim_next_concurrently(store).await;
        }
        #[$attr]
        async fn apply_outcome_completed $args {
          let store = $store;
          $crate::store::testing::apply_outcome_completed(store).await;
        }
        #[$attr]
        async fn apply_outcome_stale_state $args {
          let store = $store;
          $crate::store::testing::apply_outcome_stale_state(store).await;
        }
        #[$attr]
        async fn apply_outcome_stale_claimant $args {
          let store = $store;
          $crate::store::testing::apply_outcome_stale_claimant(store).await;
        }
        #[$attr]
        async fn apply_outcome_not_found $args {
          let store = $store;
          $crate::store::testing::apply_outcome_not_found(store).await;
        }
        #[$attr]
        async fn retry_until_dead $args {
          let store = $store;
          $crate::store::testing::retry_until_dead(store).await;
        }
        #[$attr]
        async fn release_stale_claims $args {
          let store = $store;
          $crate::store::testing::release_stale_claims(store).await;
        }
        #[$attr]
        async fn revive_dead_job $args {
          let store = $store;
          $crate::store::testing::revive_dead_job(store).await;
        }
        #[$attr]
        async fn revive_requires_dead $args {
          let store = $store;
          $crate::store::testing::revive_requires_dead(store).await;
        }
        #[$attr]
        async fn revive_not_found $args {
          let store = $store;
          $crate::store::testing::revive_not_found(store).await;
        }
        #[$attr]
        async fn summary_counts_every_state $args {
          let store = $store;
          $crate::store::testing::summary_counts_every_state(store).await;
        }
        #[$attr]
        async fn heartbeat_refreshes_lease $args {
          let store = $store;
          $crate::store::testing::heartbeat_refreshes_lease(store).await;
        }
        #[$attr]
        async fn register_worker_releases_previous_claims $args {
          let store = $store;
          $crate::store::testing::register_worker_releases_previous_claims(store).await;
        }
        #[$attr]
        async fn worker_lifecycle $args {
          let store = $store;
          $crate::store::testing::worker_lifecycle(store).await;
        }
        #[$attr]
        async fn request_stop_single_worker $args {
          let store = $store;
          $crate::store::testing::request_stop_single_worker(store).await;
        }
        #[$attr]
        async fn unknown_worker $args {
          let store = $store;
          $crate::store::testing::unknown_worker(store).await;
        }
        #[$attr]
        async fn clear $args {
          let store = $store;
          $crate::store::testing::clear(store).await;
        }
    };
}

pub use store_test_suite;

/// A fixed point in time, `secs` seconds after an arbitrary epoch.
///
/// Whole milliseconds so stores with millisecond precision round-trip it exactly.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap_or_default()
}

fn new_job(id: &str) -> NewJob {
    NewJob {
        id: id.into(),
        command: format!("echo {id}"),
        max_retries: 3,
        backoff_base: 2,
    }
}

fn failure() -> ExecutionResult {
    ExecutionError {
        error_type: ErrorType::ExitCode,
        message: "exited with code 1".to_owned(),
        result_code: Some(1),
    }
    .into()
}

async fn claim(store: &impl JobStore, worker: &str, now: DateTime<Utc>) -> Job {
    store
        .claim_next(&worker.into(), now)
        .await
        .unwrap()
        .unwrap()
}

#[doc(hidden)]
pub async fn insert_and_get(store: impl JobStore) {
    let inserted = store.insert(new_job("a"), at(0)).await.unwrap();

    assert_eq!(inserted.state, JobState::Pending);
    assert_eq!(inserted.attempts, 0);
    assert_eq!(inserted.created_at, at(0));
    assert_eq!(inserted.updated_at, at(0));
    assert_eq!(inserted.next_eligible_at, None);
    assert_eq!(inserted.claimed_by, None);
    assert_eq!(store.get(&"a".into()).await.unwrap(), inserted);
}

#[doc(hidden)]
pub async fn insert_duplicate_id(store: impl JobStore) {
    let original = store.insert(new_job("a"), at(0)).await.unwrap();
    let duplicate = NewJob {
        command: "something else".to_owned(),
        ..new_job("a")
    };

    let result = store.insert(duplicate, at(5)).await;

    assert!(matches!(result, Err(StoreError::DuplicateId(id)) if id.as_str() == "a"));
    assert_eq!(store.get(&"a".into()).await.unwrap(), original);
}

#[doc(hidden)]
pub async fn get_not_found(store: impl JobStore) {
    let result = store.get(&"missing".into()).await;

    assert!(matches!(result, Err(StoreError::JobNotFound(id)) if id.as_str() == "missing"));
}

#[doc(hidden)]
pub async fn list_filters_by_state(store: impl JobStore) {
    store.insert(new_job("b"), at(1)).await.unwrap();
    store.insert(new_job("a"), at(1)).await.unwrap();
    store.insert(new_job("c"), at(0)).await.unwrap();
    claim(&store, WORKER, at(2)).await;

    let ids = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();

    assert_eq!(
        ids(store.list(None).await.unwrap()),
        vec![JobId::from("c"), JobId::from("a"), JobId::from("b")]
    );
    assert_eq!(
        ids(store.list(Some(JobState::Pending)).await.unwrap()),
        vec![JobId::from("a"), JobId::from("b")]
    );
    assert_eq!(
        ids(store.list(Some(JobState::Processing)).await.unwrap()),
        vec![JobId::from("c")]
    );
    assert!(store.list(Some(JobState::Dead)).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn claim_next_empty(store: impl JobStore) {
    assert_eq!(store.claim_next(&WORKER.into(), at(0)).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn claim_next_marks_processing(store: impl JobStore) {
    store.insert(new_job("a"), at(0)).await.unwrap();

    let job = claim(&store, WORKER, at(3)).await;

    assert_eq!(job.id, JobId::from("a"));
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.claimed_by, Some(WorkerId::from(WORKER)));
    assert_eq!(job.updated_at, at(3));
    assert_eq!(job.attempts, 0);
    assert_eq!(store.get(&job.id).await.unwrap(), job);
    assert_eq!(store.claim_next(&OTHER_WORKER.into(), at(3)).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn claim_next_in_ready_order(store: impl JobStore) {
    store.insert(new_job("late"), at(2)).await.unwrap();
    store.insert(new_job("b"), at(1)).await.unwrap();
    store.insert(new_job("a"), at(1)).await.unwrap();
    // Fails once, becoming ready again at 0 + 2s, between "a"/"b" and "late".
    store.insert(new_job("retried"), at(0)).await.unwrap();
    let job = claim(&store, WORKER, at(0)).await;
    assert_eq!(job.id, JobId::from("retried"));
    let (_, transition) = policy::resolve(&job, &failure(), at(0));
    store.apply_outcome(transition).await.unwrap();

    let mut order = vec![];
    while let Some(job) = store.claim_next(&WORKER.into(), at(10)).await.unwrap() {
        order.push(job.id);
    }

    assert_eq!(
        order,
        vec![
            JobId::from("a"),
            JobId::from("b"),
            JobId::from("late"),
            JobId::from("retried"),
        ]
    );
}

#[doc(hidden)]
pub async fn claim_next_skips_ineligible_jobs(store: impl JobStore) {
    store.insert(new_job("waiting"), at(0)).await.unwrap();
    let job = claim(&store, WORKER, at(0)).await;
    let (_, transition) = policy::resolve(&job, &failure(), at(0));
    store.apply_outcome(transition).await.unwrap();
    store.insert(new_job("done"), at(1)).await.unwrap();
    let job = claim(&store, WORKER, at(1)).await;
    let (_, transition) = policy::resolve(&job, &ExecutionResult::Done, at(1));
    store.apply_outcome(transition).await.unwrap();

    assert_eq!(store.claim_next(&WORKER.into(), at(1)).await.unwrap(), None);

    let job = claim(&store, WORKER, at(2)).await;
    assert_eq!(job.id, JobId::from("waiting"));
    assert_eq!(job.attempts, 1);
}

#[doc(hidden)]
pub async fn claim_next_concurrently<S>(store: S)
where
    S: JobStore + Clone + 'static,
{
    const JOBS: usize = 20;
    const WORKERS: usize = 4;
    for i in 0..JOBS {
        store.insert(new_job(&format!("job-{i:02}")), at(0)).await.unwrap();
    }

    let handles = (0..WORKERS).map(|worker| {
        let store = store.clone();
        tokio::spawn(async move {
            let worker_id = WorkerId::from(format!("worker-{worker}"));
            let mut claimed = vec![];
            while let Some(job) = store.claim_next(&worker_id, at(1)).await.unwrap() {
                assert_eq!(job.claimed_by.as_ref(), Some(&worker_id));
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            claimed
        })
    });
    let claimed = futures::future::join_all(handles)
        .await
        .into_iter()
        .flat_map(|result| result.unwrap())
        .collect::<Vec<_>>();

    let unique = claimed.iter().collect::<HashSet<_>>();
    assert_eq!(claimed.len(), JOBS);
    assert_eq!(unique.len(), JOBS);
}

#[doc(hidden)]
pub async fn apply_outcome_completed(store: impl JobStore) {
    store.insert(new_job("a"), at(0)).await.unwrap();
    let job = claim(&store, WORKER, at(1)).await;
    let (resolution, transition) = policy::resolve(&job, &ExecutionResult::Done, at(2));
    assert_eq!(resolution, Resolution::Completed);

    let job = store.apply_outcome(transition).await.unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.claimed_by, None);
    assert_eq!(job.result_code, Some(0));
    assert_eq!(job.updated_at, at(2));
    assert_eq!(store.get(&job.id).await.unwrap(), job);
}

#[doc(hidden)]
pub async fn apply_outcome_stale_state(store: impl JobStore) {
    store.insert(new_job("a"), at(0)).await.unwrap();
    let job = claim(&store, WORKER, at(1)).await;
    let (_, transition) = policy::resolve(&job, &ExecutionResult::Done, at(2));
    store.apply_outcome(transition.clone()).await.unwrap();

    let result = store.apply_outcome(transition).await;

    assert!(matches!(
        result,
        Err(StoreError::StaleWrite { id, expected: JobState::Processing }) if id.as_str() == "a"
    ));
    assert_eq!(store.get(&"a".into()).await.unwrap().attempts, 1);
}

#[doc(hidden)]
pub async fn apply_outcome_stale_claimant(store: impl JobStore) {
    store.insert(new_job("a"), at(0)).await.unwrap();
    let abandoned = claim(&store, WORKER, at(0)).await;
    store
        .release_stale_claims(TimeDelta::seconds(10), at(20))
        .await
        .unwrap();
    let reclaimed = claim(&store, OTHER_WORKER, at(21)).await;

    let (_, transition) = policy::resolve(&abandoned, &ExecutionResult::Done, at(22));
    let result = store.apply_outcome(transition).await;

    assert!(matches!(result, Err(StoreError::StaleWrite { .. })));
    assert_eq!(store.get(&"a".into()).await.unwrap(), reclaimed);
}

#[doc(hidden)]
pub async fn apply_outcome_not_found(store: impl JobStore) {
    let transition = Transition {
        id: "missing".into(),
        expected_state: JobState::Processing,
        expected_claimant: Some(WORKER.into()),
        new_state: JobState::Completed,
        attempts: 1,
        next_eligible_at: None,
        last_error: None,
        result_code: Some(0),
        now: at(0),
    };

    let result = store.apply_outcome(transition).await;

    assert!(matches!(result, Err(StoreError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn retry_until_dead(store: impl JobStore) {
    store.insert(new_job("a"), at(0)).await.unwrap();

    let job = claim(&store, WORKER, at(0)).await;
    let (resolution, transition) = policy::resolve(&job, &failure(), at(0));
    let job = store.apply_outcome(transition).await.unwrap();
    assert_eq!(resolution, Resolution::Retrying);
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.next_eligible_at, Some(at(2)));
    assert_eq!(job.last_error.as_deref(), Some("exit_code: exited with code 1"));
    assert_eq!(store.claim_next(&WORKER.into(), at(1)).await.unwrap(), None);

    let job = claim(&store, WORKER, at(2)).await;
    let (_, transition) = policy::resolve(&job, &failure(), at(2));
    let job = store.apply_outcome(transition).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.next_eligible_at, Some(at(6)));

    let job = claim(&store, WORKER, at(6)).await;
    let (resolution, transition) = policy::resolve(&job, &failure(), at(6));
    let job = store.apply_outcome(transition).await.unwrap();
    assert_eq!(resolution, Resolution::Dead);
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.result_code, Some(1));
    assert_eq!(store.claim_next(&WORKER.into(), at(1000)).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn release_stale_claims(store: impl JobStore) {
    store.insert(new_job("old"), at(0)).await.unwrap();
    store.insert(new_job("fresh"), at(1)).await.unwrap();
    claim(&store, WORKER, at(0)).await;
    claim(&store, OTHER_WORKER, at(8)).await;

    let released = store
        .release_stale_claims(TimeDelta::seconds(5), at(10))
        .await
        .unwrap();

    assert_eq!(released, vec![JobId::from("old")]);
    let old = store.get(&"old".into()).await.unwrap();
    assert_eq!(old.state, JobState::Pending);
    assert_eq!(old.claimed_by, None);
    assert_eq!(old.attempts, 0);
    assert_eq!(old.updated_at, at(10));
    let fresh = store.get(&"fresh".into()).await.unwrap();
    assert_eq!(fresh.state, JobState::Processing);
    assert!(store
        .release_stale_claims(TimeDelta::seconds(5), at(10))
        .await
        .unwrap()
        .is_empty());
}

async fn kill(store: &impl JobStore, id: &str) -> Job {
    store
        .insert(NewJob { max_retries: 1, ..new_job(id) }, at(0))
        .await
        .unwrap();
    let job = claim(store, WORKER, at(0)).await;
    let (_, transition) = policy::resolve(&job, &failure(), at(1));
    store.apply_outcome(transition).await.unwrap()
}

#[doc(hidden)]
pub async fn revive_dead_job(store: impl JobStore) {
    let dead = kill(&store, "a").await;
    assert_eq!(dead.state, JobState::Dead);

    let job = store.revive(&"a".into(), at(5)).await.unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.next_eligible_at, None);
    assert_eq!(job.updated_at, at(5));
    assert_eq!(job.max_retries, 1);
    assert_eq!(claim(&store, WORKER, at(5)).await.id, JobId::from("a"));
}

#[doc(hidden)]
pub async fn revive_requires_dead(store: impl JobStore) {
    let pending = store.insert(new_job("a"), at(0)).await.unwrap();

    let result = store.revive(&"a".into(), at(5)).await;

    assert!(matches!(
        result,
        Err(StoreError::InvalidState {
            actual: JobState::Pending,
            required: JobState::Dead,
            ..
        })
    ));
    assert_eq!(store.get(&"a".into()).await.unwrap(), pending);
}

#[doc(hidden)]
pub async fn revive_not_found(store: impl JobStore) {
    let result = store.revive(&"missing".into(), at(0)).await;

    assert!(matches!(result, Err(StoreError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn summary_counts_every_state(store: impl JobStore) {
    let empty = store.summary().await.unwrap();
    assert_eq!(empty.total(), 0);
    assert!(empty.iter().all(|(_, count)| count == 0));
    assert_eq!(empty.iter().count(), JobState::ALL.len());

    kill(&store, "dead").await;
    store.insert(new_job("pending-1"), at(1)).await.unwrap();
    store.insert(new_job("pending-2"), at(2)).await.unwrap();
    store.insert(new_job("processing"), at(0)).await.unwrap();
    claim(&store, WORKER, at(3)).await;

    let summary = store.summary().await.unwrap();

    assert_eq!(summary.get(JobState::Pending), 2);
    assert_eq!(summary.get(JobState::Processing), 1);
    assert_eq!(summary.get(JobState::Completed), 0);
    assert_eq!(summary.get(JobState::Failed), 0);
    assert_eq!(summary.get(JobState::Dead), 1);
    assert_eq!(summary.total(), 4);
}

#[doc(hidden)]
pub async fn heartbeat_refreshes_lease(store: impl JobStore) {
    store
        .register_worker(WorkerRecord::new(WORKER.into(), at(0)))
        .await
        .unwrap();
    store.insert(new_job("a"), at(0)).await.unwrap();
    claim(&store, WORKER, at(0)).await;

    store.heartbeat(&WORKER.into(), at(8)).await.unwrap();
    let released = store
        .release_stale_claims(TimeDelta::seconds(5), at(10))
        .await
        .unwrap();

    assert!(released.is_empty());
    assert_eq!(store.get(&"a".into()).await.unwrap().updated_at, at(8));
}

#[doc(hidden)]
pub async fn register_worker_releases_previous_claims(store: impl JobStore) {
    for id in [WORKER, OTHER_WORKER] {
        store
            .register_worker(WorkerRecord::new(id.into(), at(0)))
            .await
            .unwrap();
    }
    store.insert(new_job("orphan"), at(0)).await.unwrap();
    store.insert(new_job("other"), at(1)).await.unwrap();
    claim(&store, WORKER, at(2)).await;
    claim(&store, OTHER_WORKER, at(3)).await;

    let released = store
        .register_worker(WorkerRecord::new(WORKER.into(), at(100)))
        .await
        .unwrap();
    store.heartbeat(&WORKER.into(), at(101)).await.unwrap();

    assert_eq!(released, vec![JobId::from("orphan")]);
    let orphan = store.get(&"orphan".into()).await.unwrap();
    assert_eq!(orphan.state, JobState::Pending);
    assert_eq!(orphan.claimed_by, None);
    assert_eq!(orphan.attempts, 0);
    assert_eq!(orphan.updated_at, at(100));
    let other = store.get(&"other".into()).await.unwrap();
    assert_eq!(other.state, JobState::Processing);
    assert_eq!(other.claimed_by, Some(WorkerId::from(OTHER_WORKER)));
    assert_eq!(
        claim(&store, WORKER, at(102)).await.id,
        JobId::from("orphan")
    );
}

#[doc(hidden)]
pub async fn worker_lifecycle(store: impl JobStore) {
    let record = WorkerRecord::new(WORKER.into(), at(0));
    store.register_worker(record.clone()).await.unwrap();
    store
        .register_worker(WorkerRecord::new(OTHER_WORKER.into(), at(0)))
        .await
        .unwrap();
    assert_eq!(store.list_workers().await.unwrap()[0], record);

    assert_eq!(
        store.heartbeat(&WORKER.into(), at(1)).await.unwrap(),
        WorkerStatus::Running
    );
    assert_eq!(store.request_stop(None).await.unwrap(), 2);
    assert_eq!(
        store.heartbeat(&WORKER.into(), at(2)).await.unwrap(),
        WorkerStatus::Stopping
    );
    store.mark_worker_stopped(&WORKER.into(), at(3)).await.unwrap();

    let workers = store.list_workers().await.unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].id, WorkerId::from(WORKER));
    assert_eq!(workers[0].status, WorkerStatus::Stopped);
    assert_eq!(workers[0].heartbeat_at, at(3));
    assert_eq!(workers[0].pid, record.pid);
    assert_eq!(workers[1].status, WorkerStatus::Stopping);
    assert_eq!(store.request_stop(None).await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn request_stop_single_worker(store: impl JobStore) {
    for id in [WORKER, OTHER_WORKER] {
        store
            .register_worker(WorkerRecord::new(id.into(), at(0)))
            .await
            .unwrap();
    }

    assert_eq!(store.request_stop(Some(OTHER_WORKER.into())).await.unwrap(), 1);
    assert_eq!(
        store.heartbeat(&WORKER.into(), at(1)).await.unwrap(),
        WorkerStatus::Running
    );
    assert_eq!(
        store.heartbeat(&OTHER_WORKER.into(), at(1)).await.unwrap(),
        WorkerStatus::Stopping
    );
}

#[doc(hidden)]
pub async fn unknown_worker(store: impl JobStore) {
    assert!(matches!(
        store.heartbeat(&"ghost".into(), at(0)).await,
        Err(StoreError::WorkerNotFound(_))
    ));
    assert!(matches!(
        store.mark_worker_stopped(&"ghost".into(), at(0)).await,
        Err(StoreError::WorkerNotFound(_))
    ));
    assert_eq!(store.request_stop(Some("ghost".into())).await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn clear(store: impl JobStore) {
    store.insert(new_job("a"), at(0)).await.unwrap();
    store
        .register_worker(WorkerRecord::new(WORKER.into(), at(0)))
        .await
        .unwrap();

    store.clear().await.unwrap();

    assert!(store.list(None).await.unwrap().is_empty());
    assert!(store.list_workers().await.unwrap().is_empty());
    assert_eq!(store.summary().await.unwrap().total(), 0);
    store.insert(new_job("a"), at(1)).await.unwrap();
}
