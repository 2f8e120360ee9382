//! Module providing the retention policies used for trimming a segmented log.
//!
//! A policy looks at the [`SegmentStat`] of every segment in a log (oldest first) and returns
//! the index of the oldest segment to retain. Every segment in front of that index may be
//! deleted. The active (last) segment is always retained.
//!
//! Policies are built from a string map of options:
//!
//! | `Name`        | Parameter                                          |
//! |---------------|----------------------------------------------------|
//! | `Duration`    | `Duration`: human readable duration, e.g. `"36h"`  |
//! | `MaxLogBytes` | `MaxLogBytes`: maximum number of bytes to retain   |
//!
//! A missing `Name` selects `MaxLogBytes`.

use super::segment::SegmentStat;
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::HashMap, error::Error, fmt::Display, num::ParseIntError, time::Duration};

/// Options used for constructing a [`Cleaner`].
pub type CleanerOptions = HashMap<String, String>;

pub const NAME_KEY: &str = "Name";
pub const DURATION_KEY: &str = "Duration";
pub const MAX_LOG_BYTES_KEY: &str = "MaxLogBytes";

#[derive(Debug)]
pub enum CleanerError {
    UnknownCleaner(String),
    MissingOption(&'static str),
    InvalidDuration {
        value: String,
        source: humantime::DurationError,
    },
    DurationOutOfRange(Duration),
    InvalidMaxLogBytes {
        value: String,
        source: ParseIntError,
    },
}

impl Display for CleanerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownCleaner(name) => write!(f, "Unknown cleaner: {}", name),
            Self::MissingOption(key) => write!(f, "Missing cleaner option: {}", key),
            Self::InvalidDuration { value, source } => {
                write!(f, "Invalid cleaner duration {:?}: {}", value, source)
            }
            Self::DurationOutOfRange(duration) => {
                write!(f, "Cleaner duration {:?} is out of range.", duration)
            }
            Self::InvalidMaxLogBytes { value, source } => {
                write!(f, "Invalid cleaner byte limit {:?}: {}", value, source)
            }
        }
    }
}

impl Error for CleanerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidDuration { source, .. } => Some(source),
            Self::InvalidMaxLogBytes { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Capability shared by all retention policies.
pub trait RetentionPolicy {
    /// Returns the index of the oldest segment to retain, evaluated at the given instant.
    fn retain_from_at(&self, segments: &[SegmentStat], now: DateTime<Utc>) -> usize;

    /// Returns the index of the oldest segment to retain, evaluated now.
    fn retain_from(&self, segments: &[SegmentStat]) -> usize {
        self.retain_from_at(segments, Utc::now())
    }
}

/// Retains segments holding at least one entry younger than a fixed duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationCleaner {
    duration: TimeDelta,
}

impl DurationCleaner {
    pub fn new(duration: Duration) -> Result<Self, CleanerError> {
        TimeDelta::from_std(duration)
            .map(|duration| Self { duration })
            .map_err(|_| CleanerError::DurationOutOfRange(duration))
    }
}

impl RetentionPolicy for DurationCleaner {
    fn retain_from_at(&self, segments: &[SegmentStat], now: DateTime<Utc>) -> usize {
        let cutoff = match now.checked_sub_signed(self.duration) {
            Some(cutoff) => cutoff,
            None => return 0,
        };

        let retain_from = segments
            .iter()
            .position(|segment| {
                segment
                    .last_timestamp
                    .map_or(true, |timestamp| timestamp >= cutoff)
            })
            .unwrap_or(segments.len());

        clamp_to_active(retain_from, segments)
    }
}

/// Retains the newest segments whose cumulative size stays within a byte limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeCleaner {
    max_log_bytes: u64,
}

impl SizeCleaner {
    pub fn new(max_log_bytes: u64) -> Self {
        Self { max_log_bytes }
    }
}

impl RetentionPolicy for SizeCleaner {
    fn retain_from_at(&self, segments: &[SegmentStat], _: DateTime<Utc>) -> usize {
        let mut retained_bytes = 0_u64;

        for (index, segment) in segments.iter().enumerate().rev() {
            retained_bytes = retained_bytes.saturating_add(segment.size);

            if retained_bytes > self.max_log_bytes {
                return clamp_to_active(index + 1, segments);
            }
        }

        0
    }
}

#[inline]
fn clamp_to_active(retain_from: usize, segments: &[SegmentStat]) -> usize {
    retain_from.min(segments.len().saturating_sub(1))
}

/// Retention policy of a segmented log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleaner {
    Duration(DurationCleaner),
    Size(SizeCleaner),
}

impl Cleaner {
    /// Builds the cleaner described by the given options.
    pub fn from_options(options: &CleanerOptions) -> Result<Self, CleanerError> {
        match options.get(NAME_KEY).map(String::as_str) {
            Some(DURATION_KEY) => {
                let value = options
                    .get(DURATION_KEY)
                    .ok_or(CleanerError::MissingOption(DURATION_KEY))?;

                let duration =
                    humantime::parse_duration(value).map_err(|source| CleanerError::InvalidDuration {
                        value: value.clone(),
                        source,
                    })?;

                DurationCleaner::new(duration).map(Self::Duration)
            }
            Some(MAX_LOG_BYTES_KEY) | None => {
                let value = options
                    .get(MAX_LOG_BYTES_KEY)
                    .ok_or(CleanerError::MissingOption(MAX_LOG_BYTES_KEY))?;

                let max_log_bytes =
                    value
                        .trim()
                        .parse()
                        .map_err(|source| CleanerError::InvalidMaxLogBytes {
                            value: value.clone(),
                            source,
                        })?;

                Ok(Self::Size(SizeCleaner::new(max_log_bytes)))
            }
            Some(name) => Err(CleanerError::UnknownCleaner(name.to_string())),
        }
    }

    /// Options selecting a [`DurationCleaner`] with the given human readable duration.
    pub fn duration_options(duration: &str) -> CleanerOptions {
        CleanerOptions::from([
            (NAME_KEY.to_string(), DURATION_KEY.to_string()),
            (DURATION_KEY.to_string(), duration.to_string()),
        ])
    }

    /// Options selecting a [`SizeCleaner`] with the given byte limit.
    pub fn max_log_bytes_options(max_log_bytes: u64) -> CleanerOptions {
        CleanerOptions::from([
            (NAME_KEY.to_string(), MAX_LOG_BYTES_KEY.to_string()),
            (MAX_LOG_BYTES_KEY.to_string(), max_log_bytes.to_string()),
        ])
    }
}

impl TryFrom<&CleanerOptions> for Cleaner {
    type Error = CleanerError;

    fn try_from(options: &CleanerOptions) -> Result<Self, Self::Error> {
        Self::from_options(options)
    }
}

impl RetentionPolicy for Cleaner {
    fn retain_from_at(&self, segments: &[SegmentStat], now: DateTime<Utc>) -> usize {
        match self {
            Self::Duration(cleaner) => cleaner.retain_from_at(segments, now),
            Self::Size(cleaner) => cleaner.retain_from_at(segments, now),
        }
    }
}
