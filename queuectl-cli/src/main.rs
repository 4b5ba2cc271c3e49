use std::io;

use clap::Parser;
use queuectl_sqlx::SqliteStore;

mod cli;
mod commands;
mod config;
mod data_dir;
mod logging;
mod metrics;
mod supervisor;

use cli::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};
use config::ConfigFile;
use data_dir::DataDir;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = DataDir::new(cli.data_dir);
    data_dir.create()?;

    let loaded = ConfigFile::load(&data_dir.config_path())?;
    logging::init(&data_dir.log_path(), &loaded.config.log_level)?;
    if let Some(error) = loaded.restored_from {
        tracing::warn!(?error, "Configuration was unreadable and has been reset to defaults");
    }
    let file = loaded.config;
    // Only commands that run or feed the engine need a valid configuration.
    let config = file.to_config();

    let mut out = io::stdout();
    match cli.command {
        Command::Worker {
            command: WorkerCommand::Start { count },
        } => supervisor::start(&data_dir, &config?, count).await,
        Command::Worker {
            command: WorkerCommand::Run { name, count },
        } => supervisor::run(&data_dir, config?, name, count).await,
        Command::Config {
            command: ConfigCommand::Show,
        } => commands::config_show(&file, &mut out),
        Command::Config {
            command: ConfigCommand::Set { key, value },
        } => commands::config_set(&data_dir.config_path(), &key, &value, &mut out),
        command => {
            let config = config?;
            let store = SqliteStore::connect(data_dir.db_path()).await?;
            let result = dispatch(command, &store, &data_dir, &config, &mut out).await;
            store.close().await;
            result
        }
    }
}

async fn dispatch(
    command: Command,
    store: &SqliteStore,
    data_dir: &DataDir,
    config: &queuectl::Config,
    out: &mut impl io::Write,
) -> anyhow::Result<()> {
    match command {
        Command::Enqueue {
            job: Some(json), ..
        } => commands::enqueue_json(store, config, &json, out)
            .await
            .map(drop),
        Command::Enqueue {
            file: Some(script), ..
        } => commands::enqueue_file(store, config, &script, &data_dir.jobs_dir(), out)
            .await
            .map(drop),
        Command::Enqueue { .. } => anyhow::bail!("Provide either a JSON job or --file"),
        Command::List { state } => commands::list(store, state, out).await,
        Command::Status => commands::status(store, out).await,
        Command::Dlq {
            command: DlqCommand::List,
        } => commands::dlq_list(store, out).await,
        Command::Dlq {
            command: DlqCommand::Retry { id },
        } => commands::dlq_retry(store, &id, out).await,
        Command::Worker {
            command: WorkerCommand::Stop,
        } => commands::worker_stop(store, out).await,
        Command::Metrics => commands::metrics(store, &data_dir.metrics_path(), out).await,
        Command::Reset { yes } => {
            commands::reset(
                store,
                &data_dir.metrics_path(),
                yes,
                &mut io::stdin().lock(),
                out,
            )
            .await
        }
        Command::Worker { .. } | Command::Config { .. } => {
            anyhow::bail!("{command:?} does not use the job store")
        }
    }
}
