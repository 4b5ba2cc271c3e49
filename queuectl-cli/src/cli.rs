use std::path::PathBuf;

use clap::{Parser, Subcommand};
use queuectl::job::JobState;

#[derive(Debug, Parser)]
#[command(name = "queuectl")]
#[command(about = "A local background job queue with retries, backoff and a dead letter queue.")]
pub(crate) struct Cli {
    /// Directory holding the queue database, configuration, metrics and logs.
    #[arg(long, global = true, default_value = "data")]
    pub(crate) data_dir: PathBuf,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Add a job to the queue.
    ///
    /// queuectl enqueue '{"id":"job1","command":"sleep 2"}'
    /// queuectl enqueue --file scripts/task.py
    Enqueue {
        /// The job as JSON: {"id"?, "command", "max_retries"?, "backoff_base"?}
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        job: Option<String>,

        /// Enqueue a script; it is copied into the data directory and its file stem is the job id.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List jobs, optionally only those in one state.
    List {
        #[arg(long)]
        state: Option<JobState>,
    },
    /// Show the number of jobs in each state and the known workers.
    Status,
    /// Inspect and retry jobs in the dead letter queue.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Manage worker processes.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Show or change the configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Show worker metrics together with live job counts.
    Metrics,
    /// Delete every job and worker record and reset the metrics. Configuration and logs are kept.
    Reset {
        /// Do not ask for confirmation.
        #[arg(long, short)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum DlqCommand {
    /// List dead jobs.
    List,
    /// Move a dead job back to pending with its attempts reset.
    Retry { id: String },
}

#[derive(Debug, Subcommand)]
pub(crate) enum WorkerCommand {
    /// Start worker processes and wait for them. Ctrl+C stops them after their current job.
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Ask every running worker, in any process, to stop after its current job.
    Stop,
    /// Run workers in this process.
    #[command(hide = true)]
    Run {
        /// Prefix for the worker ids.
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Debug, Subcommand)]
pub(crate) enum ConfigCommand {
    Show,
    /// Set a key; numeric values are stored as numbers.
    Set { key: String, value: String },
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_state_filter() {
        let cli = Cli::try_parse_from(["queuectl", "list", "--state", "dead"]).unwrap();

        assert_matches!(
            cli.command,
            Command::List {
                state: Some(JobState::Dead)
            }
        );
    }

    #[test]
    fn enqueue_requires_job_or_file() {
        assert!(Cli::try_parse_from(["queuectl", "enqueue"]).is_err());
        assert!(Cli::try_parse_from(["queuectl", "enqueue", "{}", "--file", "a.sh"]).is_err());
    }

    #[test]
    fn global_data_dir() {
        let cli =
            Cli::try_parse_from(["queuectl", "worker", "start", "--data-dir", "/tmp/q"]).unwrap();

        assert_eq!(cli.data_dir, PathBuf::from("/tmp/q"));
        assert_matches!(
            cli.command,
            Command::Worker {
                command: WorkerCommand::Start { count: 1 }
            }
        );
    }
}
