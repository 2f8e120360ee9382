//! Module providing [`Store`], the record framing layer on top of a [`Storage`].
//!
//! Every record in a store is laid out as follows:
//! ```text
//! ┌─────────────────────────┬────────────────────────┬───────────────────────┐
//! │ checksum: [u8; 8]       │ length: [u8; 8]        │ record_bytes: [u8; _] │
//! └─────────────────────────┴────────────────────────┴───────────────────────┘
//! │─────────────── RecordHeader ─────────────────────│
//! ```
//! Both header fields are little endian. The checksum is computed over the record bytes with
//! the store's [`Hasher`].

use self::common::{RecordHeader, RECORD_HEADER_LENGTH};
use super::super::super::storage::{AsyncConsume, AsyncTruncate, Sizable, Storage};
use async_trait::async_trait;
use std::{error::Error as StdError, hash::Hasher, marker::PhantomData};

pub mod common {
    use std::{
        hash::Hasher,
        io::{ErrorKind::UnexpectedEof, Read, Write},
    };

    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    /// Number of bytes required for storing the record header.
    pub const RECORD_HEADER_LENGTH: usize = 16;

    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct RecordHeader {
        pub checksum: u64,
        pub length: u64,
    }

    impl RecordHeader {
        /// Reads a record header from the given source.
        ///
        /// An all zero header is treated as the end of written data.
        pub fn read<R: Read>(source: &mut R) -> std::io::Result<RecordHeader> {
            let checksum = source.read_u64::<LittleEndian>()?;
            let length = source.read_u64::<LittleEndian>()?;

            if checksum == 0 && length == 0 {
                Err(std::io::Error::from(UnexpectedEof))
            } else {
                Ok(Self { checksum, length })
            }
        }

        pub fn write<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
            dest.write_u64::<LittleEndian>(self.checksum)?;
            dest.write_u64::<LittleEndian>(self.length)?;

            Ok(())
        }

        pub fn compute<H>(record_bytes: &[u8]) -> Self
        where
            H: Hasher + Default,
        {
            let mut hasher = H::default();
            hasher.write(record_bytes);

            RecordHeader {
                checksum: hasher.finish(),
                length: record_bytes.len() as u64,
            }
        }
    }
}

/// Sequence of checksummed, length prefixed records stored in a [`Storage`].
pub struct Store<S, H> {
    storage: S,

    _phantom_data: PhantomData<H>,
}

impl<S, H> Store<S, H> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            _phantom_data: PhantomData,
        }
    }
}

#[derive(Debug)]
pub enum StoreError<SE> {
    StorageError(SE),
    HeaderEncodeError(std::io::Error),
    PositionOutOfBounds { position: u64, size: u64 },
    TruncatedRecord { position: u64 },
    RecordHeaderMismatch { position: u64 },
}

impl<SE> StoreError<SE> {
    /// Whether this error stems from corrupt or partially written data, as opposed to a
    /// failure of the underlying storage.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::TruncatedRecord { .. } | Self::RecordHeaderMismatch { .. }
        )
    }

    /// Whether the record header or the record runs past the end of the store.
    pub fn is_truncated_record(&self) -> bool {
        matches!(self, Self::TruncatedRecord { .. })
    }
}

impl<SE> std::fmt::Display for StoreError<SE>
where
    SE: StdError,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StorageError(err) => write!(f, "Storage error occurred: {}", err),
            Self::HeaderEncodeError(err) => write!(f, "Unable to encode record header: {}", err),
            Self::PositionOutOfBounds { position, size } => write!(
                f,
                "Position {} lies beyond the end of the store ({} bytes).",
                position, size
            ),
            Self::TruncatedRecord { position } => {
                write!(f, "Record at position {} is truncated.", position)
            }
            Self::RecordHeaderMismatch { position } => write!(
                f,
                "Record at position {} does not match its header.",
                position
            ),
        }
    }
}

impl<SE> StdError for StoreError<SE> where SE: StdError {}

impl<S, H> Store<S, H>
where
    S: Storage,
    H: Hasher + Default,
{
    /// Reads the record at the given position.
    ///
    /// Returns the record bytes along with the position of the next record, or [`None`] if the
    /// given position is exactly the end of this store.
    pub async fn read(&self, position: u64) -> Result<Option<(Vec<u8>, u64)>, StoreError<S::Error>> {
        let size = self.size();

        if position == size {
            return Ok(None);
        } else if position > size {
            return Err(StoreError::PositionOutOfBounds { position, size });
        }

        let header_length = RECORD_HEADER_LENGTH as u64;

        if position + header_length > size {
            return Err(StoreError::TruncatedRecord { position });
        }

        let header_bytes = self
            .storage
            .read(position, header_length)
            .await
            .map_err(StoreError::StorageError)?;

        let record_header = RecordHeader::read(&mut header_bytes.as_slice())
            .map_err(|_| StoreError::TruncatedRecord { position })?;

        let record_position = position + header_length;

        if record_header.length > size - record_position {
            return Err(StoreError::TruncatedRecord { position });
        }

        let record_bytes = self
            .storage
            .read(record_position, record_header.length)
            .await
            .map_err(StoreError::StorageError)?;

        if RecordHeader::compute::<H>(&record_bytes) != record_header {
            return Err(StoreError::RecordHeaderMismatch { position });
        }

        Ok(Some((record_bytes, record_position + record_header.length)))
    }

    /// Appends a record containing the given bytes.
    ///
    /// Returns the position of the record and the total number of bytes written, header
    /// included.
    pub async fn append(&mut self, record_bytes: &[u8]) -> Result<(u64, u64), StoreError<S::Error>> {
        let mut framed = Vec::with_capacity(RECORD_HEADER_LENGTH + record_bytes.len());

        RecordHeader::compute::<H>(record_bytes)
            .write(&mut framed)
            .map_err(StoreError::HeaderEncodeError)?;
        framed.extend_from_slice(record_bytes);

        self.storage
            .append_slice(&framed)
            .await
            .map_err(StoreError::StorageError)
    }

    pub async fn flush(&mut self) -> Result<(), StoreError<S::Error>> {
        self.storage.flush().await.map_err(StoreError::StorageError)
    }

    pub fn unflushed(&self) -> u64 {
        self.storage.unflushed()
    }
}

#[async_trait]
impl<S: Storage, H: Send + Sync> AsyncTruncate for Store<S, H> {
    type Mark = u64;

    type TruncError = StoreError<S::Error>;

    async fn truncate(&mut self, position: &Self::Mark) -> Result<(), Self::TruncError> {
        self.storage
            .truncate(position)
            .await
            .map_err(StoreError::StorageError)
    }
}

#[async_trait]
impl<S: Storage, H: Send + Sync> AsyncConsume for Store<S, H> {
    type ConsumeError = StoreError<S::Error>;

    async fn remove(self) -> Result<(), Self::ConsumeError> {
        self.storage
            .remove()
            .await
            .map_err(StoreError::StorageError)
    }

    async fn close(self) -> Result<(), Self::ConsumeError> {
        self.storage.close().await.map_err(StoreError::StorageError)
    }
}

impl<S: Storage, H> Sizable for Store<S, H> {
    fn size(&self) -> u64 {
        self.storage.size()
    }
}

pub(crate) mod test {
    use super::{
        super::super::super::storage::{AsyncConsume, AsyncTruncate, Sizable, Storage},
        common::RECORD_HEADER_LENGTH,
        Store, StoreError,
    };
    use std::future::Future;

    pub(crate) const _RECORDS: [&[u8]; 6] = [
        b"T0fesa77T0fesa77T0fesa77T0fesa77",
        b"9Yxuipjd9Yxuipjd9Yxuipjd9Yxuipjd9Yxuipjd",
        b"zjxEHzMs",
        b"9cOGqwqc9cOGqwqc9cOGqwqc",
        b"ZXI6B7XcZXI6B7XcZXI6B7XcZXI6B7XcZXI6B7XcZXI6B7Xc",
        b"9sjES6nO9sjES6nO",
    ];

    pub(crate) async fn _test_store_read_append_truncate_consistency<SP, F, S>(
        storage_provider: SP,
    ) where
        SP: Fn() -> F,
        F: Future<Output = S>,
        S: Storage,
    {
        let mut store = Store::<S, crc32fast::Hasher>::new(storage_provider().await);

        assert!(matches!(store.read(0).await, Ok(None)));
        assert!(matches!(
            store.read(1).await,
            Err(StoreError::PositionOutOfBounds { .. })
        ));

        let mut positions = Vec::with_capacity(_RECORDS.len());

        for record in _RECORDS {
            let (position, bytes_written) = store.append(record).await.unwrap();
            assert_eq!(bytes_written, (RECORD_HEADER_LENGTH + record.len()) as u64);
            positions.push(position);
        }

        let store = if S::is_persistent() {
            store.close().await.unwrap();
            Store::<S, crc32fast::Hasher>::new(storage_provider().await)
        } else {
            store
        };

        let mut position = 0;
        for (i, record) in _RECORDS.iter().enumerate() {
            assert_eq!(position, positions[i]);

            let (record_bytes, next_position) = store.read(position).await.unwrap().unwrap();
            assert_eq!(&record_bytes, record);

            position = next_position;
        }

        assert_eq!(position, store.size());
        assert!(matches!(store.read(position).await, Ok(None)));

        // a position in the middle of a record never decodes
        assert!(store.read(positions[1] + 3).await.unwrap_err().is_decode_error());

        let truncate_index = positions.len() / 2;
        let mut store = store;

        store.truncate(&positions[truncate_index]).await.unwrap();
        assert_eq!(store.size(), positions[truncate_index]);

        let mut i = 0;
        let mut position = 0;
        while let Some((record_bytes, next_position)) = store.read(position).await.unwrap() {
            assert_eq!(&record_bytes, _RECORDS[i]);
            position = next_position;
            i += 1;
        }

        assert_eq!(i, truncate_index);

        store.remove().await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::{common::RECORD_HEADER_LENGTH, test::*, *};
    use crate::storage::impls::in_mem::InMemStorage;

    #[tokio::test]
    async fn test_store_read_append_truncate_consistency() {
        _test_store_read_append_truncate_consistency(|| async { InMemStorage::default() }).await;
    }

    #[tokio::test]
    async fn test_store_detects_torn_and_corrupt_records() {
        let mut storage = InMemStorage::default();

        let mut header = Vec::new();
        RecordHeader::compute::<crc32fast::Hasher>(b"Hello World!")
            .write(&mut header)
            .unwrap();

        // header promising more bytes than were written
        storage.append_slice(&header).await.unwrap();
        storage.append_slice(b"Hello").await.unwrap();

        let store = Store::<InMemStorage, crc32fast::Hasher>::new(storage);
        assert!(matches!(
            store.read(0).await,
            Err(StoreError::TruncatedRecord { position: 0 })
        ));

        let mut storage = InMemStorage::default();
        storage.append_slice(&header).await.unwrap();
        storage.append_slice(b"Hello Wurld!").await.unwrap();

        let store = Store::<InMemStorage, crc32fast::Hasher>::new(storage);
        assert!(matches!(
            store.read(0).await,
            Err(StoreError::RecordHeaderMismatch { position: 0 })
        ));

        let mut storage = InMemStorage::default();
        storage.append_slice(&header[..RECORD_HEADER_LENGTH - 1]).await.unwrap();

        let store = Store::<InMemStorage, crc32fast::Hasher>::new(storage);
        assert!(store.read(0).await.unwrap_err().is_decode_error());
    }
}
