//! Module providing [`Segment`], a bounded run of encoded entries within a segmented log.
//!
//! Each entry is stored as one [`Store`] record whose bytes are the bincode encoded
//! [`EntryMetadata`] followed by the raw payload:
//! ```text
//! ┌──────────────────┬─────────────────┬───────────────────────────────┬──────────────────┐
//! │ checksum: u64 LE │ length: u64 LE  │ metadata: { timestamp: i64 }  │ payload: [u8; _] │
//! └──────────────────┴─────────────────┴───────────────────────────────┴──────────────────┘
//! ```

use super::{
    super::{
        super::{
            common::{
                serde_compat::{bincode::BinCode, SerializationProvider},
                split::SplitAt,
            },
            storage::{AsyncConsume, AsyncTruncate, Sizable, Storage},
        },
        Entry,
    },
    store::{common::RECORD_HEADER_LENGTH, Store, StoreError},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{error::Error as StdError, fmt::Display};
use tracing::warn;

/// Metadata stored in front of every entry payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Nanoseconds since the Unix epoch.
    pub timestamp_nanos: i64,
}

/// Number of bytes used by the bincode representation of [`EntryMetadata`].
pub const ENTRY_METADATA_LENGTH: usize = 8;

/// Summary of a segment's contents, kept up to date on every append and recovered on open.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentStat {
    pub size: u64,
    pub entry_count: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl SegmentStat {
    fn record(&mut self, timestamp: DateTime<Utc>, bytes_written: u64) {
        self.size += bytes_written;
        self.entry_count += 1;
        self.first_timestamp.get_or_insert(timestamp);
        self.last_timestamp = Some(timestamp);
    }
}

#[derive(Debug)]
pub enum SegmentError<SE> {
    StoreError(StoreError<SE>),
    SerializationError(bincode::Error),
    TimestampOutOfRange(DateTime<Utc>),
    MissingEntryMetadata { position: u64 },
}

impl<SE> SegmentError<SE> {
    /// Whether this error was caused by reading corrupt or partially written data.
    pub fn is_decode_error(&self) -> bool {
        match self {
            Self::StoreError(err) => err.is_decode_error(),
            Self::SerializationError(_) | Self::MissingEntryMetadata { .. } => true,
            Self::TimestampOutOfRange(_) => false,
        }
    }

    /// Whether this error was caused by a partially written last entry.
    pub fn is_truncated_record(&self) -> bool {
        matches!(self, Self::StoreError(err) if err.is_truncated_record())
    }
}

impl<SE> Display for SegmentError<SE>
where
    SE: StdError,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreError(err) => write!(f, "Store error occurred: {}", err),
            Self::SerializationError(err) => {
                write!(f, "Unable to (de)serialize entry metadata: {}", err)
            }
            Self::TimestampOutOfRange(timestamp) => write!(
                f,
                "Timestamp {} cannot be represented in nanoseconds.",
                timestamp
            ),
            Self::MissingEntryMetadata { position } => {
                write!(f, "Record at position {} is too short for an entry.", position)
            }
        }
    }
}

impl<SE> StdError for SegmentError<SE> where SE: StdError {}

/// A contiguous run of entries starting at a fixed logical offset of the log.
///
/// Positions accepted and returned by the methods of a segment are relative to the start of
/// the segment.
pub struct Segment<S> {
    store: Store<S, crc32fast::Hasher>,
    base_offset: u64,

    stat: SegmentStat,
}

impl<S> Segment<S>
where
    S: Storage,
{
    /// Opens a segment over the given storage.
    ///
    /// Existing entries are scanned to recover the [`SegmentStat`]. A partially written last
    /// entry is truncated away. Recovery stops at a corrupt entry, whose bytes are kept so that
    /// reads report it.
    pub async fn open(storage: S, base_offset: u64) -> Result<Self, SegmentError<S::Error>> {
        let mut segment = Self {
            store: Store::new(storage),
            base_offset,
            stat: SegmentStat::default(),
        };

        segment.recover_stat().await?;

        Ok(segment)
    }

    async fn recover_stat(&mut self) -> Result<(), SegmentError<S::Error>> {
        let mut stat = SegmentStat::default();

        loop {
            match self.read_at(stat.size).await {
                Ok(Some((entry, next_position))) => {
                    stat.record(entry.timestamp, next_position - stat.size);
                }
                Ok(None) => break,
                Err(error) if error.is_truncated_record() => {
                    warn!(
                        base_offset = self.base_offset,
                        position = stat.size,
                        size = self.store.size(),
                        "discarding torn segment tail: {}",
                        error
                    );

                    self.store
                        .truncate(&stat.size)
                        .await
                        .map_err(SegmentError::StoreError)?;

                    break;
                }
                Err(error) if error.is_decode_error() => {
                    warn!(
                        base_offset = self.base_offset,
                        position = stat.size,
                        size = self.store.size(),
                        "corrupt entry in segment: {}",
                        error
                    );

                    stat.size = self.store.size();

                    break;
                }
                Err(error) => return Err(error),
            }
        }

        self.stat = stat;

        Ok(())
    }

    /// Number of bytes the given entry occupies once appended.
    #[inline]
    pub fn encoded_len(entry: &Entry) -> u64 {
        (RECORD_HEADER_LENGTH + ENTRY_METADATA_LENGTH + entry.data.len()) as u64
    }

    /// Appends the given entry at the end of this segment, returning the number of bytes
    /// written.
    pub async fn append(&mut self, entry: &Entry) -> Result<u64, SegmentError<S::Error>> {
        let metadata = EntryMetadata {
            timestamp_nanos: entry
                .timestamp
                .timestamp_nanos_opt()
                .ok_or(SegmentError::TimestampOutOfRange(entry.timestamp))?,
        };

        let mut record_bytes =
            BinCode::serialize(&metadata).map_err(SegmentError::SerializationError)?;
        record_bytes.extend_from_slice(&entry.data);

        let (_, bytes_written) = self
            .store
            .append(&record_bytes)
            .await
            .map_err(SegmentError::StoreError)?;

        self.stat.record(entry.timestamp, bytes_written);

        Ok(bytes_written)
    }

    /// Decodes the entry at the given position.
    ///
    /// Returns the entry along with the position of the next one, or [`None`] at the end of
    /// this segment.
    pub async fn read_at(
        &self,
        position: u64,
    ) -> Result<Option<(Entry, u64)>, SegmentError<S::Error>> {
        let (record_bytes, next_position) = match self
            .store
            .read(position)
            .await
            .map_err(SegmentError::StoreError)?
        {
            Some(record) => record,
            None => return Ok(None),
        };

        let (metadata_bytes, data) =
            SplitAt::split_at(Bytes::from(record_bytes), ENTRY_METADATA_LENGTH)
                .ok_or(SegmentError::MissingEntryMetadata { position })?;

        let metadata: EntryMetadata =
            BinCode::deserialize(&metadata_bytes).map_err(SegmentError::SerializationError)?;

        let entry = Entry {
            timestamp: DateTime::from_timestamp_nanos(metadata.timestamp_nanos),
            data,
        };

        Ok(Some((entry, next_position)))
    }

    /// Discards every entry from the given position onwards.
    ///
    /// The position is expected to lie on an entry boundary. Any partial entry left in front of
    /// it is discarded as well.
    pub async fn truncate(&mut self, position: u64) -> Result<(), SegmentError<S::Error>> {
        self.store
            .truncate(&position)
            .await
            .map_err(SegmentError::StoreError)?;

        self.recover_stat().await
    }

    pub async fn flush(&mut self) -> Result<(), SegmentError<S::Error>> {
        self.store.flush().await.map_err(SegmentError::StoreError)
    }

    pub fn unflushed(&self) -> u64 {
        self.store.unflushed()
    }

    #[inline]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Logical log offset right after the last entry of this segment.
    #[inline]
    pub fn next_offset(&self) -> u64 {
        self.base_offset + self.size()
    }

    #[inline]
    pub fn stat(&self) -> SegmentStat {
        self.stat
    }

    #[inline]
    pub fn entry_count(&self) -> usize {
        self.stat.entry_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stat.entry_count == 0
    }

    #[inline]
    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.stat.first_timestamp
    }

    #[inline]
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.stat.last_timestamp
    }
}

impl<S: Storage> Sizable for Segment<S> {
    fn size(&self) -> u64 {
        self.store.size()
    }
}

impl<S: Storage> Segment<S> {
    /// Deletes the storage backing this segment.
    pub async fn remove(self) -> Result<(), SegmentError<S::Error>> {
        self.store.remove().await.map_err(SegmentError::StoreError)
    }

    /// Releases the storage backing this segment without deleting it.
    pub async fn close(self) -> Result<(), SegmentError<S::Error>> {
        self.store.close().await.map_err(SegmentError::StoreError)
    }
}

pub(crate) mod test {
    use super::{
        super::super::{super::storage::Storage, Entry},
        Segment,
    };
    use chrono::{DateTime, Duration, Utc};
    use std::future::Future;

    pub(crate) const _PAYLOADS: [&[u8]; 4] = [
        b"bid=431.50 ask=431.55",
        b"{\"open\":12.1,\"close\":12.4}",
        b"",
        b"Curabitur vel nibh ac nunc consequat efficitur.",
    ];

    pub(crate) fn _entries_starting_at(start: DateTime<Utc>) -> Vec<Entry> {
        _PAYLOADS
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                Entry::new(
                    start + Duration::milliseconds(i as i64 * 1500),
                    payload.to_vec(),
                )
            })
            .collect()
    }

    pub(crate) async fn _test_segment_reopen_recovers_stats<SP, F, S>(storage_provider: SP)
    where
        SP: Fn() -> F,
        F: Future<Output = S>,
        S: Storage,
    {
        const BASE_OFFSET: u64 = 1024;

        let start = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let entries = _entries_starting_at(start);

        let mut segment = Segment::open(storage_provider().await, BASE_OFFSET)
            .await
            .unwrap();

        assert!(segment.is_empty());
        assert_eq!(segment.next_offset(), BASE_OFFSET);

        let mut expected_size = 0;
        for entry in &entries {
            let bytes_written = segment.append(entry).await.unwrap();
            assert_eq!(bytes_written, Segment::<S>::encoded_len(entry));
            expected_size += bytes_written;
        }

        segment.flush().await.unwrap();

        let stat = segment.stat();

        assert_eq!(stat.size, expected_size);
        assert_eq!(stat.entry_count, entries.len());
        assert_eq!(stat.first_timestamp, Some(entries[0].timestamp));
        assert_eq!(stat.last_timestamp, entries.last().map(|x| x.timestamp));

        let segment = if S::is_persistent() {
            segment.close().await.unwrap();
            Segment::open(storage_provider().await, BASE_OFFSET)
                .await
                .unwrap()
        } else {
            segment
        };

        assert_eq!(segment.stat(), stat);
        assert_eq!(segment.next_offset(), BASE_OFFSET + expected_size);

        let mut position = 0;
        for entry in &entries {
            let (read_entry, next_position) = segment.read_at(position).await.unwrap().unwrap();
            assert_eq!(&read_entry, entry);
            position = next_position;
        }

        assert!(segment.read_at(position).await.unwrap().is_none());

        segment.remove().await.unwrap();
    }
}
