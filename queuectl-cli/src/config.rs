//! The `config.json` file in the data directory.
//!
//! A missing file is created with the defaults. A file that cannot be parsed is replaced by the
//! defaults rather than failing every command.
use std::{path::Path, time::Duration};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How many heartbeat intervals a lease must span.
const LEASE_HEARTBEATS: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ConfigFile {
    pub(crate) max_retries: u32,
    pub(crate) backoff_base: u32,
    #[serde(alias = "worker_poll_interval")]
    pub(crate) poll_interval_seconds: f64,
    pub(crate) lease_timeout_seconds: u64,
    pub(crate) heartbeat_interval_seconds: f64,
    /// `null` disables the timeout.
    pub(crate) job_timeout_seconds: Option<u64>,
    pub(crate) log_level: String,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let config = queuectl::Config::default();
        Self {
            max_retries: config.max_retries,
            backoff_base: config.backoff_base,
            poll_interval_seconds: config.poll_interval.as_secs_f64(),
            lease_timeout_seconds: config.lease_timeout.as_secs(),
            heartbeat_interval_seconds: config.heartbeat_interval.as_secs_f64(),
            job_timeout_seconds: config.job_timeout.map(|timeout| timeout.as_secs()),
            log_level: "INFO".to_owned(),
        }
    }
}

pub(crate) struct Loaded {
    pub(crate) config: ConfigFile,
    /// Set when the file existed but could not be parsed and was reset.
    pub(crate) restored_from: Option<serde_json::Error>,
}

impl ConfigFile {
    pub(crate) fn load(path: &Path) -> anyhow::Result<Loaded> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                return Ok(Loaded {
                    config,
                    restored_from: None,
                });
            }
            Err(error) => {
                return Err(error).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        match serde_json::from_str(&contents) {
            Ok(config) => Ok(Loaded {
                config,
                restored_from: None,
            }),
            Err(error) => {
                let config = Self::default();
                config.save(path)?;
                Ok(Loaded {
                    config,
                    restored_from: Some(error),
                })
            }
        }
    }

    pub(crate) fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// The settings keyed by name.
    pub(crate) fn entries(&self) -> anyhow::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => bail!("Configuration serialized to {other}, expected an object"),
        }
    }

    /// Sets `key` from its command line representation.
    ///
    /// Values that parse as JSON (numbers, booleans, `null`) are stored as such, anything else
    /// as a string. The result must still be a valid configuration.
    pub(crate) fn set(&mut self, key: &str, raw: &str) -> anyhow::Result<()> {
        let key = match key {
            "worker_poll_interval" => "poll_interval_seconds",
            key => key,
        };
        let mut entries = self.entries()?;
        if !entries.contains_key(key) {
            let known = entries.keys().cloned().collect::<Vec<_>>().join(", ");
            bail!("Unknown configuration key {key:?}, expected one of: {known}");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
        entries.insert(key.to_owned(), value);

        let updated: Self = serde_json::from_value(Value::Object(entries))
            .with_context(|| format!("Invalid value {raw:?} for {key}"))?;
        updated.to_config()?;
        *self = updated;
        Ok(())
    }

    /// Converts to the engine's settings, validating durations.
    ///
    /// The lease must outlast at least [`LEASE_HEARTBEATS`] heartbeats, otherwise a job that is
    /// still running can be reclaimed and run a second time.
    pub(crate) fn to_config(&self) -> anyhow::Result<queuectl::Config> {
        let heartbeat_interval =
            positive_seconds("heartbeat_interval_seconds", self.heartbeat_interval_seconds)?;
        let lease_timeout = Duration::from_secs(self.lease_timeout_seconds);
        if heartbeat_interval
            .checked_mul(LEASE_HEARTBEATS)
            .map_or(true, |minimum| lease_timeout < minimum)
        {
            bail!(
                "lease_timeout_seconds must be at least {LEASE_HEARTBEATS} times \
                 heartbeat_interval_seconds ({}), got {}",
                self.heartbeat_interval_seconds,
                self.lease_timeout_seconds
            );
        }

        Ok(queuectl::Config {
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            poll_interval: positive_seconds("poll_interval_seconds", self.poll_interval_seconds)?,
            lease_timeout,
            heartbeat_interval,
            job_timeout: self.job_timeout_seconds.map(Duration::from_secs),
        })
    }
}

fn positive_seconds(key: &str, seconds: f64) -> anyhow::Result<Duration> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if !duration.is_zero() => Ok(duration),
        _ => bail!("{key} must be a positive number of seconds, got {seconds}"),
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let loaded = ConfigFile::load(&path).unwrap();

        assert_eq!(loaded.config, ConfigFile::default());
        assert!(loaded.restored_from.is_none());
        assert!(path.exists());
    }

    #[test]
    fn corrupt_file_is_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let loaded = ConfigFile::load(&path).unwrap();

        assert_eq!(loaded.config, ConfigFile::default());
        assert!(loaded.restored_from.is_some());
        assert_eq!(ConfigFile::load(&path).unwrap().config, ConfigFile::default());
    }

    #[test]
    fn partial_file_uses_defaults_and_alias() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_retries": 5, "worker_poll_interval": 0.5}"#).unwrap();

        let config = ConfigFile::load(&path).unwrap().config;

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.poll_interval_seconds, 0.5);
        assert_eq!(config.backoff_base, 2);
    }

    #[test]
    fn set_parses_numbers_and_strings() {
        let mut config = ConfigFile::default();

        config.set("max_retries", "5").unwrap();
        config.set("log_level", "DEBUG").unwrap();
        config.set("worker_poll_interval", "0.25").unwrap();
        config.set("job_timeout_seconds", "null").unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.poll_interval_seconds, 0.25);
        assert_eq!(config.job_timeout_seconds, None);
    }

    #[test]
    fn set_rejects_unknown_keys_and_bad_values() {
        let mut config = ConfigFile::default();

        assert!(config.set("colour", "blue").is_err());
        assert!(config.set("max_retries", "many").is_err());
        assert!(config.set("max_retries", "-1").is_err());
        assert!(config.set("poll_interval_seconds", "0").is_err());
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn lease_must_span_several_heartbeats() {
        let mut config = ConfigFile::default();

        assert!(config.set("lease_timeout_seconds", "0").is_err());
        assert!(config.set("lease_timeout_seconds", "9").is_err());
        assert!(config.set("heartbeat_interval_seconds", "301").is_err());
        assert_eq!(config, ConfigFile::default());

        config.set("lease_timeout_seconds", "10").unwrap();
        assert_eq!(
            config.to_config().unwrap().lease_timeout,
            Duration::from_secs(10)
        );
        assert_matches!(
            ConfigFile {
                lease_timeout_seconds: 0,
                ..Default::default()
            }
            .to_config(),
            Err(_)
        );
    }

    #[test]
    fn converts_to_engine_config() {
        let config = ConfigFile::default().to_config().unwrap();

        assert_eq!(config, queuectl::Config::default());
        assert_matches!(
            ConfigFile {
                heartbeat_interval_seconds: f64::NAN,
                ..Default::default()
            }
            .to_config(),
            Err(_)
        );
    }
}
