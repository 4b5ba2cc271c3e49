//! The retry policy: turns the result of executing a claimed job into the job's next state.
//!
//! Every execution counts as one attempt. A failed job whose attempts reach its `max_retries`
//! goes to the dead letter queue; otherwise it becomes pending again once
//! `backoff_base ^ attempts` seconds have passed.
use chrono::{DateTime, Utc};

use crate::{
    backoff::{Exponential, Strategy},
    executor::ExecutionResult,
    job::{Job, JobState},
    store::Transition,
};

/// What happened to a job as a result of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Retrying,
    Dead,
}

/// Computes the transition for a job that was `processing` and has finished executing.
pub fn resolve(
    job: &Job,
    result: &ExecutionResult,
    now: DateTime<Utc>,
) -> (Resolution, Transition) {
    let attempts = job.attempts.saturating_add(1);
    let transition = Transition {
        id: job.id.clone(),
        expected_state: JobState::Processing,
        expected_claimant: job.claimed_by.clone(),
        new_state: JobState::Completed,
        attempts,
        next_eligible_at: None,
        last_error: None,
        result_code: Some(0),
        now,
    };

    match result {
        ExecutionResult::Done => (Resolution::Completed, transition),
        ExecutionResult::Error { error } if attempts >= job.max_retries => (
            Resolution::Dead,
            Transition {
                new_state: JobState::Dead,
                last_error: Some(error.to_string()),
                result_code: error.result_code,
                ..transition
            },
        ),
        ExecutionResult::Error { error } => {
            let delay = Exponential::new(job.backoff_base).backoff(attempts);
            (
                Resolution::Retrying,
                Transition {
                    new_state: JobState::Pending,
                    next_eligible_at: Some(
                        now.checked_add_signed(delay)
                            .unwrap_or(DateTime::<Utc>::MAX_UTC),
                    ),
                    last_error: Some(error.to_string()),
                    result_code: error.result_code,
                    ..transition
                },
            )
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use crate::executor::{ErrorType, ExecutionError};

    use super::*;

    fn claimed_job(attempts: u32, now: DateTime<Utc>) -> Job {
        Job {
            id: "job".into(),
            command: "false".to_owned(),
            state: JobState::Processing,
            attempts,
            max_retries: 3,
            backoff_base: 2,
            created_at: now,
            updated_at: now,
            next_eligible_at: None,
            claimed_by: Some("worker".into()),
            last_error: None,
            result_code: None,
        }
    }

    fn failure(code: i32) -> ExecutionResult {
        ExecutionError {
            error_type: ErrorType::ExitCode,
            message: format!("exited with code {code}"),
            result_code: Some(code),
        }
        .into()
    }

    #[test]
    fn completed() {
        let now = Utc::now();
        let job = claimed_job(0, now);

        let (resolution, transition) = resolve(&job, &ExecutionResult::Done, now);

        assert_eq!(resolution, Resolution::Completed);
        assert_eq!(transition.new_state, JobState::Completed);
        assert_eq!(transition.attempts, 1);
        assert_eq!(transition.result_code, Some(0));
        assert_eq!(transition.expected_state, JobState::Processing);
        assert_eq!(transition.expected_claimant, Some("worker".into()));
        assert_eq!(transition.claimed_by(), None);
    }

    #[test]
    fn failure_schedules_retry_with_backoff() {
        let now = Utc::now();

        let (resolution, first) = resolve(&claimed_job(0, now), &failure(1), now);
        let (_, second) = resolve(&claimed_job(1, now), &failure(1), now);

        assert_eq!(resolution, Resolution::Retrying);
        assert_eq!(first.new_state, JobState::Pending);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.next_eligible_at, Some(now + TimeDelta::seconds(2)));
        assert_eq!(first.result_code, Some(1));
        assert_eq!(
            first.last_error.as_deref(),
            Some("exit_code: exited with code 1")
        );
        assert_eq!(second.attempts, 2);
        assert_eq!(second.next_eligible_at, Some(now + TimeDelta::seconds(4)));
    }

    #[test]
    fn failure_on_last_attempt_is_dead() {
        let now = Utc::now();

        let (resolution, transition) = resolve(&claimed_job(2, now), &failure(7), now);

        assert_eq!(resolution, Resolution::Dead);
        assert_eq!(transition.new_state, JobState::Dead);
        assert_eq!(transition.attempts, 3);
        assert_eq!(transition.next_eligible_at, None);
        assert_eq!(transition.result_code, Some(7));
    }

    #[test]
    fn zero_max_retries_goes_straight_to_dead() {
        let now = Utc::now();
        let job = Job {
            max_retries: 0,
            ..claimed_job(0, now)
        };

        assert_eq!(resolve(&job, &failure(1), now).0, Resolution::Dead);
    }

    #[test]
    fn huge_backoff_does_not_overflow() {
        let now = Utc::now();
        let job = Job {
            max_retries: u32::MAX,
            backoff_base: u32::MAX,
            ..claimed_job(40, now)
        };

        let (_, transition) = resolve(&job, &failure(1), now);

        assert_eq!(transition.next_eligible_at, Some(DateTime::<Utc>::MAX_UTC));
    }
}
