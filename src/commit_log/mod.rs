//! Module providing the entry model and the commit log backing every partition.
//!
//! A commit log is an append-only, ordered sequence of timestamped [`Entry`] values. Our only
//! commit log implementation is [`segmented_log::SegmentedLog`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamped record with an opaque payload.
///
/// An entry whose timestamp is the Unix epoch is considered "unstamped"; it is assigned the
/// current time when appended to a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Instant this entry is ordered by.
    pub timestamp: DateTime<Utc>,

    /// Opaque payload bytes.
    pub data: Bytes,
}

/// Ordered sequence of entries.
pub type Entries = Vec<Entry>;

/// The "zero" timestamp, used to represent an unset instant.
#[inline]
pub fn zero_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Returns whether the given timestamp is the zero timestamp.
#[inline]
pub fn is_zero_timestamp(timestamp: &DateTime<Utc>) -> bool {
    *timestamp == zero_timestamp()
}

impl Entry {
    pub fn new<D: Into<Bytes>>(timestamp: DateTime<Utc>, data: D) -> Self {
        Self {
            timestamp,
            data: data.into(),
        }
    }

    /// Creates an entry which is stamped with the current time on append.
    pub fn unstamped<D: Into<Bytes>>(data: D) -> Self {
        Self::new(zero_timestamp(), data)
    }

    #[inline]
    pub fn is_unstamped(&self) -> bool {
        is_zero_timestamp(&self.timestamp)
    }
}

/// Cursor style sequential reader.
///
/// Every call to [`Scanner::next`] yields the next item. Once [`None`] is returned, the scanner
/// is exhausted and keeps returning [`None`].
#[async_trait]
pub trait Scanner {
    type Item;

    /// Advances this scanner and returns the next item, if any.
    async fn next(&mut self) -> Option<Self::Item>;
}

pub mod segmented_log;
