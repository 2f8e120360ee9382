//! Module providing the configuration of a [`Cache`](crate::cache::Cache).
//!
//! Every field has a default and can be overridden from the environment:
//!
//! | Variable                  | Field                            | Example   |
//! |---------------------------|----------------------------------|-----------|
//! | `SLAIT_DATA_DIR`          | [`CacheConfig::data_dir`]        | `/data`   |
//! | `SLAIT_MAX_SEGMENT_BYTES` | `log.max_segment_bytes`          | `1048576` |
//! | `SLAIT_RETENTION`         | duration based `log.cleaner`     | `5days`   |
//! | `SLAIT_MAX_LOG_BYTES`     | size based `log.cleaner`         | `1073741824` |
//! | `SLAIT_TRIM_INTERVAL`     | [`CacheConfig::trim_interval`]   | `1m`      |
//! | `SLAIT_EVENT_BUFFER`      | [`CacheConfig::event_buffer`]    | `1024`    |

use super::{
    commit_log::segmented_log::cleaner::{Cleaner, CleanerError},
    router::DEFAULT_EVENT_BUFFER,
};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf, str::FromStr, time::Duration};

pub use super::commit_log::segmented_log::config::SegmentedLogConfig as LogConfig;

pub const DATA_DIR_VAR: &str = "SLAIT_DATA_DIR";
pub const MAX_SEGMENT_BYTES_VAR: &str = "SLAIT_MAX_SEGMENT_BYTES";
pub const RETENTION_VAR: &str = "SLAIT_RETENTION";
pub const MAX_LOG_BYTES_VAR: &str = "SLAIT_MAX_LOG_BYTES";
pub const TRIM_INTERVAL_VAR: &str = "SLAIT_TRIM_INTERVAL";
pub const EVENT_BUFFER_VAR: &str = "SLAIT_EVENT_BUFFER";

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_TRIM_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue {
        variable: &'static str,
        value: String,
        reason: String,
    },
    InvalidRetention(CleanerError),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue {
                variable,
                value,
                reason,
            } => write!(f, "Invalid value {:?} for {}: {}", value, variable, reason),
            Self::InvalidRetention(err) => write!(f, "Invalid retention policy: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding one subdirectory per topic.
    pub data_dir: PathBuf,

    /// Configuration shared by the logs of all partitions.
    pub log: LogConfig,

    /// Number of events buffered per router stream.
    pub event_buffer: usize,

    /// Period of the background trimmer.
    pub trim_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log: LogConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            trim_interval: DEFAULT_TRIM_INTERVAL,
        }
    }
}

fn parse<T>(variable: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::InvalidValue {
            variable,
            reason: err.to_string(),
            value,
        })
}

fn parse_duration(variable: &'static str, value: String) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|err| ConfigError::InvalidValue {
        variable,
        reason: err.to_string(),
        value,
    })
}

impl CacheConfig {
    /// Default configuration overridden by the `SLAIT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|variable| std::env::var(variable).ok())
    }

    /// Default configuration overridden by the values the given lookup returns for the
    /// `SLAIT_*` variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(data_dir) = lookup(DATA_DIR_VAR) {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Some(value) = lookup(MAX_SEGMENT_BYTES_VAR) {
            config.log.max_segment_bytes = parse(MAX_SEGMENT_BYTES_VAR, value)?;
        }

        if let Some(value) = lookup(RETENTION_VAR) {
            parse_duration(RETENTION_VAR, value.clone())?;
            config.log.cleaner = Cleaner::duration_options(value.trim());
        }

        if let Some(value) = lookup(MAX_LOG_BYTES_VAR) {
            let max_log_bytes = parse(MAX_LOG_BYTES_VAR, value)?;
            config.log.cleaner = Cleaner::max_log_bytes_options(max_log_bytes);
        }

        if let Some(value) = lookup(TRIM_INTERVAL_VAR) {
            config.trim_interval = parse_duration(TRIM_INTERVAL_VAR, value)?;
        }

        if let Some(value) = lookup(EVENT_BUFFER_VAR) {
            config.event_buffer = parse(EVENT_BUFFER_VAR, value)?;
        }

        config.validate()?;

        Ok(config)
    }

    /// Checks that the retention policy can be built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Cleaner::from_options(&self.log.cleaner)
            .map(|_| ())
            .map_err(ConfigError::InvalidRetention)
    }
}
