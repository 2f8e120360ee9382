//! Module providing [`Partition`], a named stream of entries backed by one [`SegmentedLog`].

use super::super::{
    commit_log::{
        is_zero_timestamp,
        segmented_log::{config::SegmentedLogConfig, SegmentedLog, SegmentedLogError},
        Entries, Entry, Scanner,
    },
    storage::{SegmentStorageProvider, Storage},
};
use chrono::{DateTime, Utc};
use std::{collections::VecDeque, error::Error as StdError, fmt::Display};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum PartitionError<SE> {
    /// An error caused by an operation on the underlying log.
    LogError(SegmentedLogError<SE>),

    /// The appended batch holds no entry newer than the last committed one.
    NothingNewToAppend {
        last_committed: Option<DateTime<Utc>>,
    },

    /// An entry of the appended batch is older than the one preceding it.
    OutOfOrder {
        index: usize,
        timestamp: DateTime<Utc>,
        previous: DateTime<Utc>,
    },

    /// The partition was removed.
    Removed,
}

impl<SE> Display for PartitionError<SE>
where
    SE: StdError,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LogError(err) => write!(f, "Log error occurred: {}", err),
            Self::NothingNewToAppend {
                last_committed: Some(last_committed),
            } => write!(
                f,
                "Nothing new to append: no entry is newer than {}",
                last_committed.to_rfc3339()
            ),
            Self::NothingNewToAppend {
                last_committed: None,
            } => write!(f, "Nothing new to append: empty batch"),
            Self::OutOfOrder {
                index,
                timestamp,
                previous,
            } => write!(
                f,
                "Entry {} at {} is older than its predecessor at {}",
                index,
                timestamp.to_rfc3339(),
                previous.to_rfc3339()
            ),
            Self::Removed => write!(f, "Partition was removed."),
        }
    }
}

impl<SE> StdError for PartitionError<SE> where SE: StdError {}

impl<SE> From<SegmentedLogError<SE>> for PartitionError<SE> {
    fn from(value: SegmentedLogError<SE>) -> Self {
        Self::LogError(value)
    }
}

/// A named stream of entries owning exactly one [`SegmentedLog`].
///
/// Appends, clears and trims take the log exclusively; reads share it.
pub struct Partition<S, SP> {
    key: String,
    log: RwLock<Option<SegmentedLog<S, SP>>>,
}

type Result<T, S> = std::result::Result<T, PartitionError<<S as Storage>::Error>>;

impl<S, SP> Partition<S, SP>
where
    S: Storage,
    SP: SegmentStorageProvider<S>,
{
    /// Opens the partition with the given key over the segments handed out by the given
    /// provider.
    pub async fn new<K: Into<String>>(
        key: K,
        config: SegmentedLogConfig,
        segment_storage_provider: SP,
    ) -> Result<Self, S> {
        let log = SegmentedLog::new(config, segment_storage_provider).await?;

        Ok(Self {
            key: key.into(),
            log: RwLock::new(Some(log)),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends the given batch.
    ///
    /// Unstamped entries are stamped in place with a single instant taken once the log is held
    /// exclusively. The batch must be non decreasing in time and must not start before the
    /// newest entry already committed; otherwise nothing is written. An I/O failure midway
    /// truncates the log back to where the batch started.
    pub async fn append(&self, entries: &mut [Entry]) -> Result<(), S> {
        let mut log = self.log.write().await;
        let log = log.as_mut().ok_or(PartitionError::Removed)?;

        let last_committed = log.last_timestamp();

        if entries.is_empty() {
            return Err(PartitionError::NothingNewToAppend { last_committed });
        }

        let now = Utc::now();
        let resolve = |entry: &Entry| {
            if entry.is_unstamped() {
                now
            } else {
                entry.timestamp
            }
        };

        if let Some(last_committed) = last_committed {
            if entries.iter().all(|entry| resolve(entry) < last_committed) {
                return Err(PartitionError::NothingNewToAppend {
                    last_committed: Some(last_committed),
                });
            }
        }

        let mut previous = last_committed;

        for (index, entry) in entries.iter().enumerate() {
            let timestamp = resolve(entry);

            match previous {
                Some(previous) if timestamp < previous => {
                    return Err(PartitionError::OutOfOrder {
                        index,
                        timestamp,
                        previous,
                    });
                }
                _ => previous = Some(timestamp),
            }
        }

        for entry in entries.iter_mut().filter(|entry| entry.is_unstamped()) {
            entry.timestamp = now;
        }

        let rollback_offset = log.tell();

        if let Err(error) = log.append(entries).await {
            if let Err(rollback_error) = log.truncate(rollback_offset).await {
                warn!(
                    partition = %self.key,
                    rollback_offset,
                    "unable to roll back partial append: {}",
                    rollback_error
                );
            }

            return Err(error.into());
        }

        Ok(())
    }

    /// Reads entries from this partition.
    ///
    /// With `last > 0`, the newest `last` entries are returned regardless of the range.
    /// Otherwise every entry with `from <= timestamp <= to` is returned, where a [`None`] or
    /// zero bound is unbounded. An inverted range returns [`None`].
    pub async fn get(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        last: usize,
    ) -> Result<Option<Entries>, S> {
        let from = from.filter(|timestamp| !is_zero_timestamp(timestamp));
        let to = to.filter(|timestamp| !is_zero_timestamp(timestamp));

        let log = self.log.read().await;
        let log = log.as_ref().ok_or(PartitionError::Removed)?;

        if last > 0 {
            return Self::read_last(log, last).await.map(Some);
        }

        if matches!((from, to), (Some(from), Some(to)) if from > to) {
            return Ok(None);
        }

        Self::read_range(log, from, to).await.map(Some)
    }

    async fn read_last(log: &SegmentedLog<S, SP>, last: usize) -> Result<Entries, S> {
        let mut segment_index = log.segment_count();
        let mut available = 0;

        for segment in log.segments().rev() {
            if available >= last {
                break;
            }

            available += segment.entry_count();
            segment_index -= 1;
        }

        let mut entries = VecDeque::with_capacity(last.min(log.len()));
        let mut scanner = log.scanner_from_segment(segment_index);

        while let Some(entry) = scanner.next().await {
            if entries.len() == last {
                entries.pop_front();
            }

            entries.push_back(entry?);
        }

        Ok(entries.into())
    }

    async fn read_range(
        log: &SegmentedLog<S, SP>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Entries, S> {
        let segment_index = match from {
            Some(from) => match log
                .segments()
                .position(|segment| segment.last_timestamp().map_or(false, |last| last >= from))
            {
                Some(segment_index) => segment_index,
                None => return Ok(Entries::new()),
            },
            None => 0,
        };

        let mut entries = Entries::new();
        let mut scanner = log.scanner_from_segment(segment_index);

        while let Some(entry) = scanner.next().await {
            let entry = entry?;

            if to.map_or(false, |to| entry.timestamp > to) {
                break;
            }

            if from.map_or(true, |from| entry.timestamp >= from) {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Number of entries in this partition.
    pub async fn len(&self) -> usize {
        self.log.read().await.as_ref().map_or(0, SegmentedLog::len)
    }

    /// Timestamp of the newest entry in this partition.
    pub async fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.log
            .read()
            .await
            .as_ref()
            .and_then(SegmentedLog::last_timestamp)
    }

    /// Number of appended bytes not yet pushed to storage.
    pub async fn unflushed(&self) -> u64 {
        self.log.read().await.as_ref().map_or(0, SegmentedLog::unflushed)
    }

    /// Discards every entry while keeping this partition usable.
    pub async fn clear(&self) -> Result<(), S> {
        let mut log = self.log.write().await;

        log.as_mut()
            .ok_or(PartitionError::Removed)?
            .clear()
            .await
            .map_err(PartitionError::LogError)
    }

    /// Applies the log's retention policy. See [`SegmentedLog::trim`].
    pub async fn trim(&self) -> Result<Option<DateTime<Utc>>, S> {
        let mut log = self.log.write().await;

        let cutoff = log
            .as_mut()
            .ok_or(PartitionError::Removed)?
            .trim()
            .await?;

        if let Some(cutoff) = cutoff {
            debug!(partition = %self.key, cutoff = %cutoff.to_rfc3339(), "trimmed partition");
        }

        Ok(cutoff)
    }

    pub async fn flush(&self) -> Result<(), S> {
        match self.log.write().await.as_mut() {
            Some(log) => log.flush().await.map_err(PartitionError::LogError),
            None => Ok(()),
        }
    }

    /// Deletes all stored data of this partition. Subsequent operations fail with
    /// [`PartitionError::Removed`].
    pub async fn remove(&self) -> Result<(), S> {
        let log = self.log.write().await.take();

        match log {
            Some(log) => log.remove().await.map_err(PartitionError::LogError),
            None => Ok(()),
        }
    }

    /// Releases the storage of this partition without deleting it. Subsequent operations fail
    /// with [`PartitionError::Removed`].
    pub async fn close(&self) -> Result<(), S> {
        let log = self.log.write().await.take();

        match log {
            Some(log) => log.close().await.map_err(PartitionError::LogError),
            None => Ok(()),
        }
    }
}

pub(crate) mod test {
    use super::super::super::commit_log::Entry;
    use chrono::{DateTime, TimeDelta, Utc};

    /// Five entries one minute apart, the newest one a minute old.
    pub(crate) fn _gen_data() -> Vec<Entry> {
        let now = Utc::now();

        (0..5_i64)
            .map(|i| {
                let timestamp = now - TimeDelta::minutes(5 - i);
                Entry::new(timestamp, format!("{{\"close\":{}}}", 100 + i).into_bytes())
            })
            .collect()
    }

    pub(crate) fn _timestamps(entries: &[Entry]) -> Vec<DateTime<Utc>> {
        entries.iter().map(|entry| entry.timestamp).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{test::*, *};
    use crate::{
        commit_log::{segmented_log::cleaner::Cleaner, zero_timestamp},
        storage::impls::in_mem::{InMemSegmentStorageProvider, InMemStorage},
    };
    use chrono::TimeDelta;

    type InMemPartition = Partition<InMemStorage, InMemSegmentStorageProvider>;

    async fn partition(max_segment_bytes: u64) -> InMemPartition {
        Partition::new(
            "AMD_bats",
            SegmentedLogConfig {
                max_segment_bytes,
                ..Default::default()
            },
            InMemSegmentStorageProvider::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_partition_range_reads() {
        for max_segment_bytes in [0, 100, 1 << 20] {
            let partition = partition(max_segment_bytes).await;

            let mut data = _gen_data();
            partition.append(&mut data).await.unwrap();

            assert_eq!(partition.get(None, None, 0).await.unwrap().unwrap(), data);

            let end = data[4].timestamp - TimeDelta::seconds(30);
            assert_eq!(
                partition
                    .get(Some(zero_timestamp()), Some(end), 0)
                    .await
                    .unwrap()
                    .unwrap(),
                data[..4]
            );

            assert_eq!(partition.get(None, None, 1).await.unwrap().unwrap(), data[4..]);
            assert_eq!(partition.get(None, None, 3).await.unwrap().unwrap(), data[2..]);
            assert_eq!(partition.get(None, None, 50).await.unwrap().unwrap(), data);
            assert_eq!(
                partition.get(None, None, usize::MAX).await.unwrap().unwrap(),
                data
            );

            assert_eq!(
                partition
                    .get(Some(data[0].timestamp), Some(data[4].timestamp), 0)
                    .await
                    .unwrap()
                    .unwrap(),
                data
            );

            assert_eq!(
                partition
                    .get(Some(data[1].timestamp), Some(data[3].timestamp), 0)
                    .await
                    .unwrap()
                    .unwrap(),
                data[1..4]
            );

            assert_eq!(
                partition
                    .get(Some(data[2].timestamp + TimeDelta::seconds(1)), None, 0)
                    .await
                    .unwrap()
                    .unwrap(),
                data[3..]
            );

            assert!(partition
                .get(Some(data[4].timestamp), Some(data[0].timestamp), 0)
                .await
                .unwrap()
                .is_none());

            // an inverted range is ignored when asking for the newest entries
            assert_eq!(
                partition
                    .get(Some(data[4].timestamp), Some(data[0].timestamp), 2)
                    .await
                    .unwrap()
                    .unwrap(),
                data[3..]
            );

            assert!(partition
                .get(Some(data[4].timestamp + TimeDelta::seconds(1)), None, 0)
                .await
                .unwrap()
                .unwrap()
                .is_empty());
        }
    }

    #[tokio::test]
    async fn test_partition_append_validation() {
        let partition = partition(1 << 20).await;

        let mut empty = Vec::new();
        assert!(matches!(
            partition.append(&mut empty).await,
            Err(PartitionError::NothingNewToAppend { .. })
        ));

        let mut unstamped = vec![Entry::unstamped(&b"abc"[..]), Entry::unstamped(&b"edf"[..])];
        partition.append(&mut unstamped).await.unwrap();

        assert!(unstamped.iter().all(|entry| !entry.is_unstamped()));
        assert_eq!(unstamped[0].timestamp, unstamped[1].timestamp);
        assert_eq!(partition.len().await, 2);

        let mut stale = vec![Entry::new(
            unstamped[1].timestamp - TimeDelta::seconds(1),
            &b"abc"[..],
        )];
        let error = partition.append(&mut stale).await.unwrap_err();

        assert!(error.to_string().starts_with("Nothing new to append"));
        assert_eq!(partition.len().await, 2);

        let newer = unstamped[1].timestamp + TimeDelta::seconds(2);
        let mut out_of_order = vec![
            Entry::new(newer, &b"x"[..]),
            Entry::new(newer - TimeDelta::seconds(1), &b"y"[..]),
        ];
        assert!(matches!(
            partition.append(&mut out_of_order).await,
            Err(PartitionError::OutOfOrder { index: 1, .. })
        ));

        // a rejected batch keeps its unset timestamps
        let mut rejected = vec![
            Entry::unstamped(&b"x"[..]),
            Entry::new(unstamped[1].timestamp, &b"y"[..]),
            Entry::new(unstamped[1].timestamp - TimeDelta::seconds(1), &b"z"[..]),
        ];
        assert!(partition.append(&mut rejected).await.is_err());
        assert!(rejected[0].is_unstamped());
        assert_eq!(partition.len().await, 2);

        let mut equal = vec![Entry::new(unstamped[1].timestamp, &b"same instant"[..])];
        partition.append(&mut equal).await.unwrap();
        assert_eq!(partition.len().await, 3);
        assert_eq!(partition.last_timestamp().await, Some(unstamped[1].timestamp));
    }

    #[tokio::test]
    async fn test_partition_clear_trim_remove() {
        let partition = Partition::<InMemStorage, _>::new(
            "topic1",
            SegmentedLogConfig {
                max_segment_bytes: 0,
                initial_offset: 0,
                cleaner: Cleaner::duration_options("5days"),
            },
            InMemSegmentStorageProvider::default(),
        )
        .await
        .unwrap();

        let start = Utc::now() - TimeDelta::days(10) + TimeDelta::hours(12);
        let mut entries = (0..10)
            .map(|i| Entry::new(start + TimeDelta::days(i), &b"abc"[..]))
            .collect::<Vec<_>>();

        partition.append(&mut entries).await.unwrap();
        assert_eq!(partition.len().await, 10);

        assert_eq!(partition.trim().await.unwrap(), Some(entries[4].timestamp));
        assert_eq!(
            _timestamps(&partition.get(None, None, 0).await.unwrap().unwrap()),
            _timestamps(&entries[5..])
        );

        assert_eq!(partition.trim().await.unwrap(), None);
        assert_eq!(partition.len().await, 5);

        partition.clear().await.unwrap();
        assert_eq!(partition.len().await, 0);
        assert!(partition.get(None, None, 0).await.unwrap().unwrap().is_empty());
        assert_eq!(partition.last_timestamp().await, None);

        // a cleared partition accepts older data again
        partition.append(&mut entries[..2]).await.unwrap();
        assert_eq!(partition.len().await, 2);

        partition.remove().await.unwrap();

        assert!(matches!(
            partition.get(None, None, 0).await,
            Err(PartitionError::Removed)
        ));
        assert!(matches!(
            partition.append(&mut entries[2..3]).await,
            Err(PartitionError::Removed)
        ));
        assert_eq!(partition.len().await, 0);

        partition.remove().await.unwrap();
    }
}
