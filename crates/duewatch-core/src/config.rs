//! Config - `duewatch.toml` の読み書き
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. `DUEWATCH_<SECTION>_<KEY>` environment variables override
//! whatever the file says.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "DUEWATCH_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("environment variable {name}={value:?}: {reason}")]
    Env {
        name: String,
        value: String,
        reason: String,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Durable queue in a SQLite file, shareable between processes.
    Sqlite,
    /// In-process queue; lost on exit.
    Memory,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Transport::Sqlite),
            "memory" => Ok(Transport::Memory),
            other => Err(format!("unknown transport {other:?} (expected sqlite or memory)")),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Sqlite => f.write_str("sqlite"),
            Transport::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("duewatch.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub transport: Transport,
    /// Broker address and credentials. Carried for broker-backed transports;
    /// the sqlite and memory transports do not read them.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Secret,
    pub name: String,
    /// Queue file for the sqlite transport.
    pub database: PathBuf,
    pub poll_interval_ms: u64,
    pub connect_retry_secs: u64,
    /// Hand back deliveries left unacknowledged by a crashed run.
    pub recover_on_start: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Sqlite,
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: Secret::new("guest"),
            name: "task-reminders".to_string(),
            database: PathBuf::from("duewatch-queue.db"),
            poll_interval_ms: 500,
            connect_retry_secs: 5,
            recover_on_start: true,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub interval_secs: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub instances: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self { instances: 1 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub scanner: ScannerConfig,
    pub consumer: ConsumerConfig,
}

impl Config {
    /// File (if given), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        cfg.apply_env(utf8_vars(std::env::vars_os()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let s = toml::to_string_pretty(self)?;
        std::fs::write(path, s).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `DUEWATCH_*` overrides from `vars`. Unknown keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "STORE_DATABASE" => self.store.database = PathBuf::from(&value),
                "QUEUE_TRANSPORT" => self.queue.transport = parse_env(&name, &value)?,
                "QUEUE_HOST" => self.queue.host = value,
                "QUEUE_PORT" => self.queue.port = parse_env(&name, &value)?,
                "QUEUE_USERNAME" => self.queue.username = value,
                "QUEUE_PASSWORD" => self.queue.password = Secret::new(value),
                "QUEUE_NAME" => self.queue.name = value,
                "QUEUE_DATABASE" => self.queue.database = PathBuf::from(&value),
                "QUEUE_POLL_INTERVAL_MS" => self.queue.poll_interval_ms = parse_env(&name, &value)?,
                "QUEUE_CONNECT_RETRY_SECS" => {
                    self.queue.connect_retry_secs = parse_env(&name, &value)?
                }
                "QUEUE_RECOVER_ON_START" => self.queue.recover_on_start = parse_env(&name, &value)?,
                "SCANNER_INTERVAL_SECS" => self.scanner.interval_secs = parse_env(&name, &value)?,
                "CONSUMER_INSTANCES" => self.consumer.instances = parse_env(&name, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner.interval_secs == 0 {
            return Err(ConfigError::Invalid("scanner.interval_secs must be positive".into()));
        }
        if self.queue.connect_retry_secs == 0 {
            return Err(ConfigError::Invalid("queue.connect_retry_secs must be positive".into()));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("queue.poll_interval_ms must be positive".into()));
        }
        if self.consumer.instances == 0 {
            return Err(ConfigError::Invalid("consumer.instances must be at least 1".into()));
        }
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.name must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
        name: name.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Environment pairs that are valid UTF-8; anything else is skipped.
fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter().filter_map(|(name, value)| {
        match (name.into_string(), value.into_string()) {
            (Ok(name), Ok(value)) => Some((name, value)),
            (name, _) => {
                let name = match name {
                    Ok(name) => name,
                    Err(raw) => raw.to_string_lossy().into_owned(),
                };
                if name.starts_with(ENV_PREFIX) {
                    tracing::warn!(name = %name, "ignoring environment variable that is not UTF-8");
                }
                None
            }
        }
    })
}
