//! In-memory [`Storage`] implementation. Nothing outlives the process; mostly useful for tests
//! and benchmarks.

use super::super::{AsyncConsume, AsyncTruncate, SegmentStorageProvider, Sizable, Storage};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    fmt::Display,
    sync::{Arc, Mutex},
};

type Mem = Arc<Mutex<Option<Vec<u8>>>>;

pub struct InMemStorage {
    storage: Mem,
    size: u64,
}

#[derive(Debug)]
pub enum InMemStorageError {
    StorageRemoved,
    LockPoisoned,
    ReadBeyondWrittenArea { position: u64, size: u64 },
    TruncateBeyondWrittenArea { position: u64 },
}

impl Display for InMemStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for InMemStorageError {}

impl InMemStorage {
    pub fn new(storage: Mem) -> Result<Self, InMemStorageError> {
        let size = storage
            .lock()
            .map_err(|_| InMemStorageError::LockPoisoned)?
            .as_ref()
            .ok_or(InMemStorageError::StorageRemoved)?
            .len() as u64;

        Ok(Self { storage, size })
    }

    fn with_bytes<T, F>(&self, f: F) -> Result<T, InMemStorageError>
    where
        F: FnOnce(&mut Vec<u8>) -> T,
    {
        let mut guard = self
            .storage
            .lock()
            .map_err(|_| InMemStorageError::LockPoisoned)?;

        guard
            .as_mut()
            .map(f)
            .ok_or(InMemStorageError::StorageRemoved)
    }
}

impl Default for InMemStorage {
    fn default() -> Self {
        Self {
            storage: Arc::new(Mutex::new(Some(Vec::new()))),
            size: 0,
        }
    }
}

impl Sizable for InMemStorage {
    fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl AsyncTruncate for InMemStorage {
    type Mark = u64;

    type TruncError = InMemStorageError;

    async fn truncate(&mut self, position: &Self::Mark) -> Result<(), Self::TruncError> {
        if *position > self.size {
            return Err(InMemStorageError::TruncateBeyondWrittenArea {
                position: *position,
            });
        }

        self.with_bytes(|bytes| bytes.truncate(*position as usize))?;
        self.size = *position;

        Ok(())
    }
}

#[async_trait]
impl AsyncConsume for InMemStorage {
    type ConsumeError = InMemStorageError;

    async fn remove(self) -> Result<(), Self::ConsumeError> {
        self.storage
            .lock()
            .map_err(|_| InMemStorageError::LockPoisoned)?
            .take();

        Ok(())
    }

    async fn close(self) -> Result<(), Self::ConsumeError> {
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemStorage {
    type Error = InMemStorageError;

    async fn append_slice(&mut self, slice: &[u8]) -> Result<(u64, u64), Self::Error> {
        let position = self.size;

        self.with_bytes(|bytes| bytes.extend_from_slice(slice))?;

        let bytes_written = slice.len() as u64;
        self.size += bytes_written;

        Ok((position, bytes_written))
    }

    async fn read(&self, position: u64, size: u64) -> Result<Vec<u8>, Self::Error> {
        if position + size > self.size {
            return Err(InMemStorageError::ReadBeyondWrittenArea { position, size });
        }

        self.with_bytes(|bytes| {
            bytes
                .get(position as usize..(position + size) as usize)
                .map(<[u8]>::to_vec)
        })?
        .ok_or(InMemStorageError::ReadBeyondWrittenArea { position, size })
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn unflushed(&self) -> u64 {
        0
    }

    fn is_persistent() -> bool {
        false
    }
}

/// Keeps the storages of every segment it handed out, so that a log reopened with the same
/// provider finds its segments again.
#[derive(Default)]
pub struct InMemSegmentStorageProvider {
    storage_map: Mutex<BTreeMap<u64, Mem>>,
}

#[async_trait]
impl SegmentStorageProvider<InMemStorage> for InMemSegmentStorageProvider {
    async fn base_offsets_of_stored_segments(&self) -> Result<Vec<u64>, InMemStorageError> {
        let storage_map = self
            .storage_map
            .lock()
            .map_err(|_| InMemStorageError::LockPoisoned)?;

        let mut base_offsets = Vec::with_capacity(storage_map.len());

        for (base_offset, mem) in storage_map.iter() {
            let present = mem
                .lock()
                .map_err(|_| InMemStorageError::LockPoisoned)?
                .is_some();

            if present {
                base_offsets.push(*base_offset);
            }
        }

        Ok(base_offsets)
    }

    async fn obtain(&self, base_offset: u64) -> Result<InMemStorage, InMemStorageError> {
        let mem = self
            .storage_map
            .lock()
            .map_err(|_| InMemStorageError::LockPoisoned)?
            .entry(base_offset)
            .or_default()
            .clone();

        mem.lock()
            .map_err(|_| InMemStorageError::LockPoisoned)?
            .get_or_insert_with(Vec::new);

        InMemStorage::new(mem)
    }

    async fn remove_all(&self) -> Result<(), InMemStorageError> {
        let mut storage_map = self
            .storage_map
            .lock()
            .map_err(|_| InMemStorageError::LockPoisoned)?;

        for mem in storage_map.values() {
            mem.lock()
                .map_err(|_| InMemStorageError::LockPoisoned)?
                .take();
        }

        storage_map.clear();

        Ok(())
    }
}

pub(crate) mod test {
    use super::super::super::{AsyncConsume, AsyncTruncate, Sizable, Storage};
    use std::future::Future;

    pub(crate) const _PAYLOADS: [&[u8]; 8] = [
        b"Donec neque velit, pulvinar in sed.",
        b"Pellentesque sodales, felis sit et.",
        b"Sed lobortis magna sem, eu laoreet.",
        b"Praesent quis varius diam. Nunc at.",
        b"bid=431.50 ask=431.55",
        b"{\"open\":12.1,\"close\":12.4}",
        b"x",
        b"Curabitur vel nibh ac nunc consequat efficitur.",
    ];

    pub(crate) async fn _test_storage_read_append_truncate_consistency<SP, F, S>(
        storage_provider: SP,
    ) where
        SP: Fn() -> F,
        F: Future<Output = S>,
        S: Storage,
    {
        let mut storage = storage_provider().await;

        assert_eq!(storage.size(), 0);
        assert!(storage.read(0, 1).await.is_err());

        let mut positions = Vec::with_capacity(_PAYLOADS.len());

        for payload in _PAYLOADS {
            let (position, bytes_written) = storage.append_slice(payload).await.unwrap();
            assert_eq!(bytes_written, payload.len() as u64);
            positions.push(position);
        }

        let expected_size: u64 = _PAYLOADS.iter().map(|x| x.len() as u64).sum();
        assert_eq!(storage.size(), expected_size);

        let mut storage = if S::is_persistent() {
            storage.close().await.unwrap();
            storage_provider().await
        } else {
            storage
        };

        assert_eq!(storage.size(), expected_size);

        for (payload, position) in _PAYLOADS.iter().zip(positions.iter()) {
            assert_eq!(
                &storage.read(*position, payload.len() as u64).await.unwrap(),
                payload
            );
        }

        let truncate_index = positions.len() / 2;
        let truncate_position = positions[truncate_index];

        assert!(storage.truncate(&(expected_size + 1)).await.is_err());

        storage.truncate(&truncate_position).await.unwrap();
        assert_eq!(storage.size(), truncate_position);

        for (i, (payload, position)) in _PAYLOADS.iter().zip(positions.iter()).enumerate() {
            let read = storage.read(*position, payload.len() as u64).await;

            if i < truncate_index {
                assert_eq!(&read.unwrap(), payload);
            } else {
                assert!(read.is_err());
            }
        }

        let (position, _) = storage.append_slice(_PAYLOADS[0]).await.unwrap();
        assert_eq!(position, truncate_position);

        storage.remove().await.unwrap();
    }
}
