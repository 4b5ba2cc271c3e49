use chrono::Utc;

use crate::{
    store::{JobStore, NewJob},
    Config, QueueError,
};

use super::{Job, JobId};

/// Builds and enqueues a [`Job`].
///
/// The retry settings default to [`Config::default`]; use [`JobBuilder::with_config`] to snapshot
/// the active configuration. Explicit [`JobBuilder::with_max_retries`] and
/// [`JobBuilder::with_backoff_base`] calls take precedence regardless of call order.
#[derive(Debug, Default)]
pub struct JobBuilder {
    id: Option<JobId>,
    command: Option<String>,
    config: Config,
    max_retries: Option<u32>,
    backoff_base: Option<u32>,
}

impl JobBuilder {
    pub fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn with_command(self, command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..self
        }
    }

    pub fn with_config(self, config: &Config) -> Self {
        Self {
            config: config.clone(),
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    pub fn with_backoff_base(self, backoff_base: u32) -> Self {
        Self {
            backoff_base: Some(backoff_base),
            ..self
        }
    }

    pub fn build(self) -> Result<NewJob, QueueError> {
        let command = self
            .command
            .filter(|command| !command.trim().is_empty())
            .ok_or(QueueError::InvalidJob("a job needs a non-empty command"))?;
        let id = match self.id {
            Some(id) if id.as_str().trim().is_empty() => {
                return Err(QueueError::InvalidJob("a job id must not be blank"))
            }
            Some(id) => id,
            None => JobId::generate(),
        };
        Ok(NewJob {
            id,
            command,
            max_retries: self.max_retries.unwrap_or(self.config.max_retries),
            backoff_base: self.backoff_base.unwrap_or(self.config.backoff_base),
        })
    }

    pub async fn enqueue<S>(self, store: &S) -> Result<Job, QueueError>
    where
        S: JobStore + ?Sized,
    {
        let job = store.insert(self.build()?, Utc::now()).await?;
        tracing::debug!(job_id = %job.id, "Enqueued job {}", job.id);
        Ok(job)
    }
}
