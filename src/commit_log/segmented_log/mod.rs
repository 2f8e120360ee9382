//! Module providing [`SegmentedLog`], the commit log backing every partition.
//!
//! A segmented log is a collection of read segments and a single write segment. It consists of
//! a [`Vec<Segment>`] for storing read segments and a single [`Option<Segment>`] for storing
//! the write segment. Offsets are logical byte positions in the log: every segment services the
//! offsets `[base_offset, base_offset + size)`.
//!
//! ```text
//! [segmented_log]
//! ┌──────────────────────────────────────────────────────────────────────────────────────┐
//! │                 ├[offset#x)        ├[offset#x + len(xe_1)]    ├[offset#y)            │
//! │  [log:"read"]   ┌──────────────────┬──────────────────┬─   ─┐                        │
//! │  offset#x ────> │ entry#xe_1       │ entry#xe_2       │ ...  │                        │
//! │                 └──────────────────┴──────────────────┴─   ─┘                        │
//! │                 ├[offset#y)                                                          │
//! │                 ┌──────────────────┬──────────────────┬─   ─┐                        │
//! │  offset#y ────> │ entry#ye_1       │ entry#ye_2       │ ...  │                        │
//! │                 └──────────────────┴──────────────────┴─   ─┘                        │
//! │                  ...                                                                 │
//! │  [log:"write"] ─> [segment](with base_offset = next_offset of last read segment)     │
//! └──────────────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All writes go to the write segment. Once the next entry would push a non empty write
//! segment past `max_segment_bytes`, the write segment is moved to the end of the read
//! segments and a new write segment is created at the end of the log.

pub mod cleaner;
pub mod segment;
pub mod store;

use self::{
    cleaner::{Cleaner, CleanerError, RetentionPolicy},
    config::SegmentedLogConfig as Config,
    segment::{Segment, SegmentError, SegmentStat},
};
use super::{
    super::storage::{SegmentStorageProvider, Sizable, Storage},
    Entry, Scanner,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use std::{error::Error as StdError, fmt::Display};
use tracing::{debug, warn};

/// Error type used by [`SegmentedLog`].
#[derive(Debug)]
pub enum SegmentedLogError<SE> {
    /// An error caused by an operation on an underlying segment.
    SegmentError(SegmentError<SE>),

    /// An error caused while obtaining or removing segment storages.
    StorageError(SE),

    /// The configured retention policy could not be built.
    CleanerError(CleanerError),

    /// The [`Option`] containing our write segment evaluates to [`None`].
    WriteSegmentLost,

    /// The given offset lies outside `[lowest, highest]`.
    OffsetOutOfBounds { offset: u64, lowest: u64, highest: u64 },
}

impl<SE> SegmentedLogError<SE> {
    /// Whether this error was caused by reading corrupt or partially written data.
    pub fn is_decode_error(&self) -> bool {
        matches!(self, Self::SegmentError(err) if err.is_decode_error())
    }
}

impl<SE> Display for SegmentedLogError<SE>
where
    SE: StdError,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SegmentError(err) => write!(f, "Segment error occurred: {}", err),
            Self::StorageError(err) => write!(f, "Storage error occurred: {}", err),
            Self::CleanerError(err) => write!(f, "Invalid retention policy: {}", err),
            Self::WriteSegmentLost => write!(f, "Write segment lost."),
            Self::OffsetOutOfBounds {
                offset,
                lowest,
                highest,
            } => write!(
                f,
                "Offset {} lies outside the log bounds [{}, {}].",
                offset, lowest, highest
            ),
        }
    }
}

impl<SE> StdError for SegmentedLogError<SE> where SE: StdError {}

/// [`SegmentedLogError`] for the storage used by a log.
pub type LogError<S> = SegmentedLogError<<S as Storage>::Error>;

/// An append-only, segmented log of [`Entry`] values.
pub struct SegmentedLog<S, SP> {
    write_segment: Option<Segment<S>>,
    read_segments: Vec<Segment<S>>,

    config: Config,
    cleaner: Cleaner,

    segment_storage_provider: SP,
}

#[doc(hidden)]
macro_rules! write_segment_ref {
    ($segmented_log:ident, $ref_method:ident) => {
        $segmented_log
            .write_segment
            .$ref_method()
            .ok_or(SegmentedLogError::WriteSegmentLost)
    };
}

impl<S, SP> SegmentedLog<S, SP>
where
    S: Storage,
    SP: SegmentStorageProvider<S>,
{
    /// Opens the segmented log whose segments are handed out by the given provider.
    ///
    /// Previously stored segments are reopened in order of their base offsets; the last one
    /// becomes the write segment. If there are none, a new write segment is created at
    /// [`Config::initial_offset`].
    ///
    /// ## Errors
    /// - [`SegmentedLogError::CleanerError`]: if the configured retention policy is invalid.
    /// - [`SegmentedLogError::StorageError`]: if stored segments could not be listed or opened.
    /// - [`SegmentedLogError::SegmentError`]: if a stored segment could not be scanned.
    pub async fn new(config: Config, segment_storage_provider: SP) -> Result<Self, LogError<S>> {
        let cleaner =
            Cleaner::from_options(&config.cleaner).map_err(SegmentedLogError::CleanerError)?;

        let base_offsets = segment_storage_provider
            .base_offsets_of_stored_segments()
            .await
            .map_err(SegmentedLogError::StorageError)?;

        let mut read_segments = Vec::with_capacity(base_offsets.len());

        for base_offset in base_offsets {
            read_segments.push(Self::open_segment(&segment_storage_provider, base_offset).await?);
        }

        let write_segment = match read_segments.pop() {
            Some(segment) => segment,
            None => Self::open_segment(&segment_storage_provider, config.initial_offset).await?,
        };

        Ok(Self {
            write_segment: Some(write_segment),
            read_segments,
            config,
            cleaner,
            segment_storage_provider,
        })
    }

    async fn open_segment(
        segment_storage_provider: &SP,
        base_offset: u64,
    ) -> Result<Segment<S>, LogError<S>> {
        let storage = segment_storage_provider
            .obtain(base_offset)
            .await
            .map_err(SegmentedLogError::StorageError)?;

        Segment::open(storage, base_offset)
            .await
            .map_err(SegmentedLogError::SegmentError)
    }

    /// "Moves" the current write segment to the end of the read segments and creates a new
    /// write segment at the end of the log.
    async fn rotate_new_write_segment(&mut self) -> Result<(), LogError<S>> {
        let mut old_write_segment = self
            .write_segment
            .take()
            .ok_or(SegmentedLogError::WriteSegmentLost)?;

        let new_write_segment_base_offset = old_write_segment.next_offset();

        if let Err(error) = old_write_segment.flush().await {
            self.write_segment = Some(old_write_segment);
            return Err(SegmentedLogError::SegmentError(error));
        }

        self.read_segments.push(old_write_segment);

        match Self::open_segment(&self.segment_storage_provider, new_write_segment_base_offset)
            .await
        {
            Ok(segment) => {
                self.write_segment = Some(segment);
            }
            Err(error) => {
                self.write_segment = self.read_segments.pop();
                return Err(error);
            }
        }

        debug!(
            base_offset = new_write_segment_base_offset,
            "rotated in new write segment"
        );

        Ok(())
    }

    /// Appends the given entries in order, rolling over to new segments as needed, and flushes
    /// the write segment.
    ///
    /// Returns the number of bytes written. Entries written before a failing entry are not
    /// rolled back here; see [`SegmentedLog::truncate`].
    pub async fn append(&mut self, entries: &[Entry]) -> Result<u64, LogError<S>> {
        let mut bytes_written = 0;

        for entry in entries {
            let write_segment = write_segment_ref!(self, as_ref)?;

            if write_segment.size() > 0
                && write_segment.size() + Segment::<S>::encoded_len(entry)
                    > self.config.max_segment_bytes
            {
                self.rotate_new_write_segment().await?;
            }

            bytes_written += write_segment_ref!(self, as_mut)?
                .append(entry)
                .await
                .map_err(SegmentedLogError::SegmentError)?;
        }

        write_segment_ref!(self, as_mut)?
            .flush()
            .await
            .map_err(SegmentedLogError::SegmentError)?;

        Ok(bytes_written)
    }

    /// Returns a scanner over the entries of this log starting at the given offset.
    ///
    /// Offsets below [`Self::lowest_offset`] start from the oldest entry. Offsets beyond
    /// [`Self::highest_offset`] yield nothing.
    pub fn scanner(&self, from: u64) -> LogScanner<'_, S, SP> {
        let (segment_index, exhausted) = if from > self.highest_offset() {
            (self.segment_count(), true)
        } else {
            (self.segment_index_for(from), false)
        };

        LogScanner {
            segmented_log: self,
            segment_index,
            position: from,
            exhausted,
        }
    }

    /// Returns a scanner over the entries of this log starting at the first entry of the
    /// segment at the given index.
    pub fn scanner_from_segment(&self, segment_index: usize) -> LogScanner<'_, S, SP> {
        LogScanner {
            segmented_log: self,
            segment_index,
            position: self
                .segment(segment_index)
                .map(Segment::base_offset)
                .unwrap_or_else(|| self.highest_offset()),
            exhausted: segment_index >= self.segment_count(),
        }
    }

    /// Returns a [`Stream`] of the entries in this log starting at the given offset.
    ///
    /// The stream ends after the last entry, or right after yielding the first error.
    pub fn read(&self, from: u64) -> impl Stream<Item = Result<Entry, LogError<S>>> + '_ {
        async_stream::stream! {
            let mut scanner = self.scanner(from);

            while let Some(item) = scanner.next().await {
                yield item;
            }
        }
    }

    /// Current end of this log. Usable as a truncation point for [`Self::truncate`].
    pub fn highest_offset(&self) -> u64 {
        self.write_segment
            .as_ref()
            .map(Segment::next_offset)
            .unwrap_or(self.config.initial_offset)
    }

    /// Alias for [`Self::highest_offset`].
    #[inline]
    pub fn tell(&self) -> u64 {
        self.highest_offset()
    }

    pub fn lowest_offset(&self) -> u64 {
        self.read_segments
            .first()
            .or(self.write_segment.as_ref())
            .map(Segment::base_offset)
            .unwrap_or(self.config.initial_offset)
    }

    /// Discards every entry at or after the given offset.
    ///
    /// Segments lying entirely after the offset are removed, the segment containing it is
    /// truncated and becomes the write segment.
    ///
    /// ## Errors
    /// - [`SegmentedLogError::OffsetOutOfBounds`]: if the offset lies outside
    /// `[lowest_offset, highest_offset]`.
    /// - [`SegmentedLogError::SegmentError`]: if a segment could not be removed or truncated.
    pub async fn truncate(&mut self, offset: u64) -> Result<(), LogError<S>> {
        let (lowest, highest) = (self.lowest_offset(), self.highest_offset());

        if offset < lowest || offset > highest {
            return Err(SegmentedLogError::OffsetOutOfBounds {
                offset,
                lowest,
                highest,
            });
        }

        let segment_index = self.segment_index_for(offset);
        let mut segments = self.take_segments()?;

        while segments.len() > segment_index + 1 {
            if let Some(segment) = segments.pop() {
                if let Err(error) = segment.remove().await {
                    self.restore_segments(segments);
                    return Err(SegmentedLogError::SegmentError(error));
                }
            }
        }

        let truncate_result = match segments.last_mut() {
            Some(segment) => {
                let position = offset - segment.base_offset();
                segment.truncate(position).await
            }
            None => Ok(()),
        };

        self.restore_segments(segments);

        truncate_result.map_err(SegmentedLogError::SegmentError)
    }

    /// Removes the segments the retention policy no longer retains.
    ///
    /// Returns the newest timestamp of the last removed segment, or [`None`] if nothing was
    /// removed. The write segment is never removed.
    pub async fn trim(&mut self) -> Result<Option<DateTime<Utc>>, LogError<S>> {
        let segment_stats = self.segments().map(Segment::stat).collect::<Vec<SegmentStat>>();

        let retain_from = self
            .cleaner
            .retain_from(&segment_stats)
            .min(self.read_segments.len());

        if retain_from == 0 {
            return Ok(None);
        }

        let expired_segments = self.read_segments.drain(..retain_from).collect::<Vec<_>>();

        let cutoff = expired_segments
            .iter()
            .rev()
            .find_map(Segment::last_timestamp);

        let mut expired_segments = expired_segments.into_iter();

        while let Some(expired_segment) = expired_segments.next() {
            let base_offset = expired_segment.base_offset();

            if let Err(error) = expired_segment.remove().await {
                let mut remaining_segments = expired_segments.collect::<Vec<_>>();
                remaining_segments.append(&mut self.read_segments);
                self.read_segments = remaining_segments;

                return Err(SegmentedLogError::SegmentError(error));
            }

            debug!(base_offset, "removed expired segment");
        }

        Ok(cutoff)
    }

    /// Removes every segment and starts over with an empty write segment at
    /// [`Config::initial_offset`].
    pub async fn clear(&mut self) -> Result<(), LogError<S>> {
        let mut remove_result = Ok(());

        for segment in self.take_segments()? {
            let base_offset = segment.base_offset();

            if let Err(error) = segment.remove().await {
                warn!(base_offset, "unable to remove segment: {}", error);

                if remove_result.is_ok() {
                    remove_result = Err(error);
                }
            }
        }

        let write_segment =
            Self::open_segment(&self.segment_storage_provider, self.config.initial_offset).await?;
        self.write_segment = Some(write_segment);

        remove_result.map_err(SegmentedLogError::SegmentError)
    }

    /// Pushes buffered appends of the write segment to its storage.
    pub async fn flush(&mut self) -> Result<(), LogError<S>> {
        write_segment_ref!(self, as_mut)?
            .flush()
            .await
            .map_err(SegmentedLogError::SegmentError)
    }

    /// Number of appended bytes not yet pushed to storage.
    pub fn unflushed(&self) -> u64 {
        self.write_segment
            .as_ref()
            .map(Segment::unflushed)
            .unwrap_or(0)
    }

    /// Removes every segment along with the container holding them.
    pub async fn remove(mut self) -> Result<(), LogError<S>> {
        for segment in self.take_segments()? {
            segment
                .remove()
                .await
                .map_err(SegmentedLogError::SegmentError)?;
        }

        self.segment_storage_provider
            .remove_all()
            .await
            .map_err(SegmentedLogError::StorageError)
    }

    /// Releases all segments without deleting any data.
    pub async fn close(mut self) -> Result<(), LogError<S>> {
        for segment in self.take_segments()? {
            segment
                .close()
                .await
                .map_err(SegmentedLogError::SegmentError)?;
        }

        Ok(())
    }

    fn take_segments(&mut self) -> Result<Vec<Segment<S>>, LogError<S>> {
        let write_segment = self
            .write_segment
            .take()
            .ok_or(SegmentedLogError::WriteSegmentLost)?;

        let mut segments = std::mem::take(&mut self.read_segments);
        segments.push(write_segment);

        Ok(segments)
    }

    fn restore_segments(&mut self, mut segments: Vec<Segment<S>>) {
        self.write_segment = segments.pop();
        self.read_segments = segments;
    }
}

impl<S, SP> SegmentedLog<S, SP>
where
    S: Storage,
{
    /// Iterator over all segments, oldest first. The write segment comes last.
    pub fn segments(&self) -> impl DoubleEndedIterator<Item = &Segment<S>> {
        self.read_segments.iter().chain(self.write_segment.iter())
    }

    pub fn segment(&self, index: usize) -> Option<&Segment<S>> {
        self.read_segments.get(index).or_else(|| {
            (index == self.read_segments.len())
                .then_some(self.write_segment.as_ref())
                .flatten()
        })
    }

    pub fn segment_count(&self) -> usize {
        self.read_segments.len() + usize::from(self.write_segment.is_some())
    }

    /// Index of the segment servicing the given offset; the last segment whose base offset is
    /// not greater than it.
    fn segment_index_for(&self, offset: u64) -> usize {
        match &self.write_segment {
            Some(write_segment) if write_segment.base_offset() <= offset => {
                self.read_segments.len()
            }
            _ => self
                .read_segments
                .iter()
                .rposition(|segment| segment.base_offset() <= offset)
                .unwrap_or(0),
        }
    }

    /// Total number of entries in this log.
    pub fn len(&self) -> usize {
        self.segments().map(Segment::entry_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of bytes stored across all segments.
    pub fn size(&self) -> u64 {
        self.segments().map(Sizable::size).sum()
    }

    /// Timestamp of the newest entry in this log.
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.segments().rev().find_map(Segment::last_timestamp)
    }

    /// Timestamp of the oldest entry in this log.
    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.segments().find_map(Segment::first_timestamp)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// [`Scanner`] over the entries of a [`SegmentedLog`].
///
/// Yields entries in log order, moving on to the next segment at the end of each one. The
/// first decode error is yielded as the final item.
pub struct LogScanner<'a, S, SP> {
    segmented_log: &'a SegmentedLog<S, SP>,
    segment_index: usize,
    position: u64,
    exhausted: bool,
}

impl<'a, S, SP> LogScanner<'a, S, SP> {
    /// Logical offset of the next entry to be read.
    pub fn offset(&self) -> u64 {
        self.position
    }
}

#[async_trait]
impl<'a, S, SP> Scanner for LogScanner<'a, S, SP>
where
    S: Storage,
    SP: SegmentStorageProvider<S>,
{
    type Item = Result<Entry, LogError<S>>;

    async fn next(&mut self) -> Option<Self::Item> {
        while !self.exhausted {
            let segment = match self.segmented_log.segment(self.segment_index) {
                Some(segment) => segment,
                None => {
                    self.exhausted = true;
                    break;
                }
            };

            let base_offset = segment.base_offset();
            let position = self.position.max(base_offset);

            match segment.read_at(position - base_offset).await {
                Ok(Some((entry, next_position))) => {
                    self.position = base_offset + next_position;
                    return Some(Ok(entry));
                }
                Ok(None) => {
                    self.position = position;
                    self.segment_index += 1;
                }
                Err(error) => {
                    self.exhausted = true;
                    return Some(Err(SegmentedLogError::SegmentError(error)));
                }
            }
        }

        None
    }
}

pub mod config {
    //! Module providing types for configuring a [`SegmentedLog`](super::SegmentedLog).

    use super::cleaner::{Cleaner, CleanerOptions};
    use serde::{Deserialize, Serialize};

    /// Default threshold for rolling over to a new segment: 1 MiB.
    pub const DEFAULT_MAX_SEGMENT_BYTES: u64 = 1 << 20;

    /// Default retention duration.
    pub const DEFAULT_RETENTION: &str = "5days";

    /// Log specific configuration.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SegmentedLogConfig {
        /// Size in bytes a non empty write segment may not exceed.
        pub max_segment_bytes: u64,

        /// Offset from which the first segment of the log starts.
        pub initial_offset: u64,

        /// Options selecting the retention policy.
        pub cleaner: CleanerOptions,
    }

    impl Default for SegmentedLogConfig {
        fn default() -> Self {
            Self {
                max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
                initial_offset: 0,
                cleaner: Cleaner::duration_options(DEFAULT_RETENTION),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::super::storage::{
            impls::{
                in_mem::{InMemSegmentStorageProvider, InMemStorage},
                tokio::{DiskSegmentStorageProvider, FileStorage},
            },
            AsyncTruncate,
        },
        cleaner::Cleaner,
        *,
    };
    use chrono::TimeDelta;
    use futures_lite::StreamExt;
    use std::{path::Path, sync::Arc};

    /// Payload length giving entries of exactly 34 bytes.
    const PAYLOAD: &[u8; 10] = b"0123456789";
    const ENCODED_ENTRY_LEN: u64 = 34;

    fn entries_at(timestamps: impl Iterator<Item = DateTime<Utc>>) -> Vec<Entry> {
        timestamps
            .enumerate()
            .map(|(i, timestamp)| {
                let mut payload = PAYLOAD.to_vec();
                payload[0] = b'a' + (i % 26) as u8;
                Entry::new(timestamp, payload)
            })
            .collect()
    }

    fn seconds_apart(count: usize, start: DateTime<Utc>) -> Vec<Entry> {
        entries_at((0..count).map(|i| start + TimeDelta::seconds(i as i64)))
    }

    fn config(max_segment_bytes: u64) -> Config {
        Config {
            max_segment_bytes,
            ..Default::default()
        }
    }

    async fn collect_entries<S, SP>(log: &SegmentedLog<S, SP>, from: u64) -> Vec<Entry>
    where
        S: Storage,
        SP: SegmentStorageProvider<S>,
    {
        log.read(from)
            .map(|entry| entry.unwrap())
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn test_segmented_log_append_read_rollover() {
        let entries = seconds_apart(10, Utc::now());

        assert_eq!(
            Segment::<InMemStorage>::encoded_len(&entries[0]),
            ENCODED_ENTRY_LEN
        );

        let mut log = SegmentedLog::new(config(110), InMemSegmentStorageProvider::default())
            .await
            .unwrap();

        assert!(log.is_empty());
        assert_eq!(log.tell(), 0);
        assert_eq!(log.last_timestamp(), None);

        let bytes_written = log.append(&entries).await.unwrap();

        assert_eq!(bytes_written, 10 * ENCODED_ENTRY_LEN);
        assert_eq!(log.tell(), 10 * ENCODED_ENTRY_LEN);
        assert_eq!(log.len(), 10);
        assert_eq!(log.unflushed(), 0);

        // three entries fit in 110 bytes
        assert_eq!(
            log.segments().map(Segment::entry_count).collect::<Vec<_>>(),
            vec![3, 3, 3, 1]
        );
        assert_eq!(
            log.segments().map(Segment::base_offset).collect::<Vec<_>>(),
            vec![0, 102, 204, 306]
        );

        assert_eq!(collect_entries(&log, 0).await, entries);
        assert_eq!(collect_entries(&log, 102).await, entries[3..]);
        assert_eq!(collect_entries(&log, 4 * ENCODED_ENTRY_LEN).await, entries[4..]);
        assert!(collect_entries(&log, log.tell()).await.is_empty());
        assert!(collect_entries(&log, log.tell() + 1).await.is_empty());

        assert_eq!(log.first_timestamp(), Some(entries[0].timestamp));
        assert_eq!(log.last_timestamp(), Some(entries[9].timestamp));

        let mut scanner = log.scanner_from_segment(3);
        assert_eq!(scanner.offset(), 306);
        assert_eq!(scanner.next().await.unwrap().unwrap(), entries[9]);
        assert!(scanner.next().await.is_none());
        assert!(scanner.next().await.is_none());

        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_segmented_log_oversized_entries_and_truncate() {
        let entries = seconds_apart(5, Utc::now());

        let mut log = SegmentedLog::new(config(16), InMemSegmentStorageProvider::default())
            .await
            .unwrap();

        let mut positions = Vec::new();

        for entry in &entries {
            positions.push(log.tell());
            log.append(std::slice::from_ref(entry)).await.unwrap();
        }

        assert_eq!(log.segment_count(), entries.len());

        assert!(matches!(
            log.truncate(log.tell() + 1).await,
            Err(SegmentedLogError::OffsetOutOfBounds { .. })
        ));

        log.truncate(positions[4]).await.unwrap();
        assert_eq!(collect_entries(&log, 0).await, entries[..4]);
        assert_eq!(log.tell(), positions[4]);

        log.truncate(positions[1] + ENCODED_ENTRY_LEN / 2).await.unwrap();
        assert_eq!(collect_entries(&log, 0).await, entries[..1]);
        assert_eq!(log.last_timestamp(), Some(entries[0].timestamp));

        // the log keeps accepting appends after a truncate
        log.append(&entries[1..]).await.unwrap();
        assert_eq!(collect_entries(&log, 0).await, entries);

        log.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_segmented_log_reopen() {
        const TEST_STORAGE_DIRECTORY: &str = "/tmp/slait_test_segmented_log_reopen";

        if Path::new(TEST_STORAGE_DIRECTORY).exists() {
            tokio::fs::remove_dir_all(TEST_STORAGE_DIRECTORY).await.unwrap();
        }

        let entries = seconds_apart(7, Utc::now());

        let mut log = SegmentedLog::<FileStorage, _>::new(
            config(110),
            DiskSegmentStorageProvider::new(TEST_STORAGE_DIRECTORY).unwrap(),
        )
        .await
        .unwrap();

        log.append(&entries).await.unwrap();
        let (segment_count, highest_offset) = (log.segment_count(), log.tell());

        log.close().await.unwrap();

        let mut log = SegmentedLog::<FileStorage, _>::new(
            config(110),
            DiskSegmentStorageProvider::new(TEST_STORAGE_DIRECTORY).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(log.segment_count(), segment_count);
        assert_eq!(log.tell(), highest_offset);
        assert_eq!(log.len(), entries.len());
        assert_eq!(collect_entries(&log, 0).await, entries);

        let more_entries = seconds_apart(2, entries[6].timestamp + TimeDelta::seconds(1));
        log.append(&more_entries).await.unwrap();
        assert_eq!(log.len(), entries.len() + more_entries.len());

        log.remove().await.unwrap();

        assert!(!Path::new(TEST_STORAGE_DIRECTORY).exists());
    }

    #[tokio::test]
    async fn test_segmented_log_trim_by_duration() {
        let now = Utc::now();

        let mut timestamps = (0..3)
            .map(|i| now - TimeDelta::hours(3) + TimeDelta::minutes(i))
            .collect::<Vec<_>>();
        timestamps.extend((0..2).map(|i| now - TimeDelta::seconds(10 - i)));

        let entries = entries_at(timestamps.into_iter());

        let mut log = SegmentedLog::new(
            Config {
                max_segment_bytes: 0,
                initial_offset: 0,
                cleaner: Cleaner::duration_options("1h"),
            },
            InMemSegmentStorageProvider::default(),
        )
        .await
        .unwrap();

        // nothing to trim in a single segment log
        assert_eq!(log.trim().await.unwrap(), None);

        log.append(&entries).await.unwrap();
        assert_eq!(log.segment_count(), 5);

        assert_eq!(log.trim().await.unwrap(), Some(entries[2].timestamp));
        assert_eq!(collect_entries(&log, 0).await, entries[3..]);
        assert_eq!(log.lowest_offset(), 3 * ENCODED_ENTRY_LEN);

        assert_eq!(log.trim().await.unwrap(), None);
        assert_eq!(log.len(), 2);

        // reads from before the lowest offset start at the oldest entry
        assert_eq!(collect_entries(&log, 0).await, entries[3..]);
    }

    #[tokio::test]
    async fn test_segmented_log_trim_keeps_write_segment() {
        let entries = entries_at((0..3).map(|i| Utc::now() - TimeDelta::days(3 - i)));

        let mut log = SegmentedLog::new(
            Config {
                max_segment_bytes: 0,
                initial_offset: 0,
                cleaner: Cleaner::duration_options("1h"),
            },
            InMemSegmentStorageProvider::default(),
        )
        .await
        .unwrap();

        log.append(&entries).await.unwrap();

        assert_eq!(log.trim().await.unwrap(), Some(entries[1].timestamp));
        assert_eq!(collect_entries(&log, 0).await, entries[2..]);
    }

    #[tokio::test]
    async fn test_segmented_log_trim_by_size() {
        let entries = seconds_apart(10, Utc::now());

        let mut log = SegmentedLog::new(
            Config {
                max_segment_bytes: 2 * ENCODED_ENTRY_LEN,
                initial_offset: 0,
                cleaner: Cleaner::max_log_bytes_options(5 * ENCODED_ENTRY_LEN),
            },
            InMemSegmentStorageProvider::default(),
        )
        .await
        .unwrap();

        log.append(&entries).await.unwrap();
        assert_eq!(log.segment_count(), 5);

        assert_eq!(log.trim().await.unwrap(), Some(entries[5].timestamp));
        assert_eq!(collect_entries(&log, 0).await, entries[6..]);

        assert_eq!(log.trim().await.unwrap(), None);
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn test_segmented_log_clear() {
        let entries = seconds_apart(6, Utc::now());

        let mut log = SegmentedLog::new(
            Config {
                max_segment_bytes: 110,
                initial_offset: 42,
                cleaner: Cleaner::max_log_bytes_options(u64::MAX),
            },
            InMemSegmentStorageProvider::default(),
        )
        .await
        .unwrap();

        log.append(&entries).await.unwrap();
        assert_eq!(log.lowest_offset(), 42);

        log.clear().await.unwrap();

        assert!(log.is_empty());
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.lowest_offset(), 42);
        assert_eq!(log.tell(), 42);
        assert!(collect_entries(&log, 0).await.is_empty());

        log.append(&entries[..2]).await.unwrap();
        assert_eq!(collect_entries(&log, 0).await, entries[..2]);
    }

    #[tokio::test]
    async fn test_segmented_log_rejects_invalid_cleaner() {
        let result = SegmentedLog::new(
            Config {
                cleaner: Cleaner::duration_options("whenever"),
                ..Default::default()
            },
            InMemSegmentStorageProvider::default(),
        )
        .await;

        assert!(matches!(result, Err(SegmentedLogError::CleanerError(_))));
    }

    #[tokio::test]
    async fn test_segmented_log_scan_stops_at_corrupt_entry() {
        let entries = seconds_apart(3, Utc::now());
        let provider = Arc::new(InMemSegmentStorageProvider::default());

        let mut log = SegmentedLog::new(config(1024), provider.clone()).await.unwrap();
        log.append(&entries).await.unwrap();

        // overwrite the tail of the last payload in place
        let mut storage = provider.obtain(0).await.unwrap();
        let size = storage.size();
        storage.truncate(&(size - 4)).await.unwrap();
        storage.append_slice(b"XXXX").await.unwrap();

        let mut scanner = log.scanner(0);

        assert_eq!(scanner.next().await.unwrap().unwrap(), entries[0]);
        assert_eq!(scanner.next().await.unwrap().unwrap(), entries[1]);
        assert!(scanner.next().await.unwrap().unwrap_err().is_decode_error());
        assert!(scanner.next().await.is_none());
    }
}
