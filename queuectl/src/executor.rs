use std::{fmt::Display, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::instrument;

use crate::job::Job;

/// How many bytes of a failed command's stderr are kept in `last_error`.
const STDERR_TAIL: usize = 512;

/// Runs a claimed job.
///
/// Implementations report every failure through [`ExecutionResult::Error`]; they never retry and
/// never return early because of a shutdown request.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> ExecutionResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Done,
    Error { error: ExecutionError },
}

impl From<ExecutionError> for ExecutionResult {
    fn from(error: ExecutionError) -> Self {
        Self::Error { error }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionError {
    pub error_type: ErrorType,
    pub message: String,
    pub result_code: Option<i32>,
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for ExecutionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// The command ran and exited with a non-zero code.
    ExitCode,
    /// The command was terminated by a signal.
    Signal,
    /// The command could not be started.
    Spawn,
    /// The command ran past the job timeout and was killed.
    Timeout,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExitCode => "exit_code",
            Self::Signal => "signal",
            Self::Spawn => "spawn",
            Self::Timeout => "timeout",
        }
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs a job's command through the platform shell in a child process.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    timeout: Option<Duration>,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run for longer than `timeout`.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    fn command(command: &str) -> Command {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C");
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c");
            cmd
        };
        cmd.arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    pub async fn run(&self, command: &str) -> ExecutionResult {
        let mut command = Self::command(command);
        let output = command.output();
        let output = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, output).await {
                Ok(output) => output,
                Err(_elapsed) => {
                    return ExecutionError {
                        error_type: ErrorType::Timeout,
                        message: format!("Command failed to complete within timeout: {timeout:?}"),
                        result_code: None,
                    }
                    .into()
                }
            },
            None => output.await,
        };

        let output = match output {
            Ok(output) => output,
            Err(error) => {
                return ExecutionError {
                    error_type: ErrorType::Spawn,
                    message: format!("Failed to start command: {error}"),
                    result_code: None,
                }
                .into()
            }
        };

        if !output.stdout.is_empty() {
            tracing::debug!(stdout = %String::from_utf8_lossy(&output.stdout).trim_end());
        }
        if output.status.success() {
            return ExecutionResult::Done;
        }

        let stderr = stderr_tail(&output.stderr);
        let (error_type, mut message) = match output.status.code() {
            Some(code) => (ErrorType::ExitCode, format!("exited with code {code}")),
            None => (ErrorType::Signal, terminated_message(&output.status)),
        };
        if !stderr.is_empty() {
            message.push_str(": ");
            message.push_str(&stderr);
        }
        ExecutionError {
            error_type,
            message,
            result_code: output.status.code(),
        }
        .into()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute(&self, job: &Job) -> ExecutionResult {
        tracing::debug!(command = %job.command, "Executing job {}", job.id);
        self.run(&job.command).await
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    let start = (start..stderr.len())
        .find(|index| stderr.is_char_boundary(*index))
        .unwrap_or(stderr.len());
    stderr[start..].to_owned()
}

#[cfg(unix)]
fn terminated_message(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => format!("terminated abnormally ({status})"),
    }
}

#[cfg(not(unix))]
fn terminated_message(status: &std::process::ExitStatus) -> String {
    format!("terminated abnormally ({status})")
}

#[cfg(all(test, unix))]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[tokio::test]
    async fn successful_command() {
        assert_eq!(ShellExecutor::new().run("exit 0").await, ExecutionResult::Done);
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code_and_stderr() {
        let result = ShellExecutor::new().run("echo boom >&2; exit 3").await;

        assert_matches!(
            result,
            ExecutionResult::Error { error: ExecutionError { error_type: ErrorType::ExitCode, result_code: Some(3), message } }
                if message == "exited with code 3: boom"
        );
    }

    #[tokio::test]
    async fn unknown_command_is_a_failure() {
        let result = ShellExecutor::new()
            .run("definitely-not-a-real-command-queuectl")
            .await;

        assert_matches!(
            result,
            ExecutionResult::Error { error: ExecutionError { error_type: ErrorType::ExitCode, result_code: Some(127), .. } }
        );
    }

    #[tokio::test]
    async fn signalled_command() {
        let result = ShellExecutor::new().run("kill -9 $$").await;

        assert_matches!(
            result,
            ExecutionResult::Error { error: ExecutionError { error_type: ErrorType::Signal, result_code: None, message } }
                if message == "terminated by signal 9"
        );
    }

    #[tokio::test]
    async fn command_exceeding_timeout_is_killed() {
        let result = ShellExecutor::new()
            .with_timeout(Some(Duration::from_millis(50)))
            .run("sleep 5")
            .await;

        assert_matches!(
            result,
            ExecutionResult::Error { error: ExecutionError { error_type: ErrorType::Timeout, result_code: None, .. } }
        );
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL) + "end";

        let tail = stderr_tail(long.as_bytes());

        assert_eq!(tail.len(), STDERR_TAIL);
        assert!(tail.ends_with("end"));
    }
}
