use std::{
    io,
    path::{Path, PathBuf},
};

/// The files queuectl keeps under `--data-dir`.
#[derive(Debug, Clone)]
pub(crate) struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub(crate) fn create(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.jobs_dir())
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn db_path(&self) -> PathBuf {
        self.root.join("queue.db")
    }

    pub(crate) fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub(crate) fn metrics_path(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    pub(crate) fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub(crate) fn log_path(&self) -> PathBuf {
        self.logs_dir().join("queuectl.log")
    }

    /// Where scripts enqueued with `--file` are copied to.
    pub(crate) fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }
}
