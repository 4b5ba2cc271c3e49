use queuectl::job::JobState;
use sqlx::{QueryBuilder, Sqlite};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Sqlite>;
}

/// Selects jobs for listing, optionally restricted to one state.
pub(crate) struct JobFilter {
    pub state: Option<JobState>,
}

impl ToQuery for JobFilter {
    fn query(&self) -> QueryBuilder<'_, Sqlite> {
        let mut builder = QueryBuilder::new(
            r#"SELECT
                id,
                command,
                state,
                attempts,
                max_retries,
                backoff_base,
                created_at,
                updated_at,
                next_eligible_at,
                claimed_by,
                last_error,
                result_code
            FROM jobs"#,
        );
        if let Some(state) = self.state {
            builder.push(" WHERE state = ");
            builder.push_bind(crate::types::JobState::from(state));
        }
        builder.push(" ORDER BY created_at, id");
        builder
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unfiltered() {
        let filter = JobFilter { state: None };

        let builder = filter.query();
        let sql = builder.sql();

        assert!(!sql.contains("WHERE"));
        assert!(sql.ends_with(" ORDER BY created_at, id"));
    }

    #[test]
    fn filtered_by_state() {
        let filter = JobFilter {
            state: Some(JobState::Dead),
        };

        let builder = filter.query();
        let sql = builder.sql();

        assert!(sql.contains(" WHERE state = ?"));
    }
}
