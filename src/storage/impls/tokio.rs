//! File backed [`Storage`] built on [`tokio::fs`].

use super::super::{AsyncConsume, AsyncTruncate, SegmentStorageProvider, Sizable, Storage};
use async_trait::async_trait;
use std::{
    collections::BinaryHeap,
    fmt::Display,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::{
    fs::{File as TokioFile, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter},
    sync::RwLock,
};

/// Extension used by the backing files of commit log segments.
pub const SEGMENT_FILE_EXTENSION: &str = "segment";

/// [`Storage`] backed by a single file.
///
/// Appends go through a write buffer which is flushed explicitly, or implicitly whenever a read
/// needs to seek the file.
pub struct FileStorage {
    storage: RwLock<BufWriter<TokioFile>>,
    backing_file_path: PathBuf,

    size: u64,
    unflushed: AtomicU64,
}

#[derive(Debug)]
pub enum FileStorageError {
    IoError(io::Error),
    ReadBeyondWrittenArea { position: u64, size: u64 },
    TruncateBeyondWrittenArea { position: u64 },
}

impl From<io::Error> for FileStorageError {
    fn from(value: io::Error) -> Self {
        Self::IoError(value)
    }
}

impl Display for FileStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(err) => write!(f, "IO error occurred: {}", err),
            Self::ReadBeyondWrittenArea { position, size } => write!(
                f,
                "Read of {} bytes at position {} lies beyond the written area.",
                size, position
            ),
            Self::TruncateBeyondWrittenArea { position } => {
                write!(f, "Truncate position {} lies beyond the written area.", position)
            }
        }
    }
}

impl std::error::Error for FileStorageError {}

impl FileStorage {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, FileStorageError> {
        let backing_file_path = path.as_ref().to_path_buf();

        let storage = Self::obtain_backing_storage(&backing_file_path).await?;

        let initial_size = storage.metadata().await?.len();

        Ok(Self {
            storage: RwLock::new(BufWriter::new(storage)),
            backing_file_path,
            size: initial_size,
            unflushed: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.backing_file_path
    }

    async fn obtain_backing_storage<P: AsRef<Path>>(path: P) -> Result<TokioFile, FileStorageError> {
        OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .read(true)
            .open(path)
            .await
            .map_err(FileStorageError::IoError)
    }
}

impl Sizable for FileStorage {
    fn size(&self) -> u64 {
        self.size
    }
}

#[async_trait]
impl AsyncTruncate for FileStorage {
    type Mark = u64;

    type TruncError = FileStorageError;

    async fn truncate(&mut self, position: &Self::Mark) -> Result<(), Self::TruncError> {
        if *position > self.size {
            return Err(FileStorageError::TruncateBeyondWrittenArea {
                position: *position,
            });
        }

        self.storage.write().await.flush().await?;

        let writer = Self::obtain_backing_storage(&self.backing_file_path).await?;

        writer.set_len(*position).await?;

        self.storage = RwLock::new(BufWriter::new(writer));
        self.size = *position;
        self.unflushed.store(0, Ordering::Release);

        Ok(())
    }
}

#[async_trait]
impl AsyncConsume for FileStorage {
    type ConsumeError = FileStorageError;

    async fn remove(self) -> Result<(), Self::ConsumeError> {
        let backing_file_path = self.backing_file_path.clone();

        drop(self.storage);

        match tokio::fs::remove_file(&backing_file_path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn close(self) -> Result<(), Self::ConsumeError> {
        let mut storage = self.storage.into_inner();

        storage.flush().await?;
        storage.get_ref().sync_all().await?;

        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    type Error = FileStorageError;

    async fn append_slice(&mut self, slice: &[u8]) -> Result<(u64, u64), Self::Error> {
        let current_position = self.size;

        self.storage.write().await.write_all(slice).await?;

        let bytes_written = slice.len() as u64;

        self.size += bytes_written;
        self.unflushed.fetch_add(bytes_written, Ordering::AcqRel);

        Ok((current_position, bytes_written))
    }

    async fn read(&self, position: u64, size: u64) -> Result<Vec<u8>, Self::Error> {
        if position + size > self.size {
            return Err(FileStorageError::ReadBeyondWrittenArea { position, size });
        }

        let mut read_buf = vec![0_u8; size as usize];

        let mut storage = self.storage.write().await;

        // seeking a BufWriter writes out its buffer first
        storage.seek(io::SeekFrom::Start(position)).await?;
        self.unflushed.store(0, Ordering::Release);

        storage.read_exact(&mut read_buf).await?;

        storage.seek(io::SeekFrom::Start(self.size)).await?;

        Ok(read_buf)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.storage.write().await.flush().await?;
        self.unflushed.store(0, Ordering::Release);

        Ok(())
    }

    fn unflushed(&self) -> u64 {
        self.unflushed.load(Ordering::Acquire)
    }

    fn is_persistent() -> bool {
        true
    }
}

/// Provides [`FileStorage`] instances for segments stored in one directory, one file per
/// segment named after the segment's base offset.
#[derive(Debug, Clone)]
pub struct DiskSegmentStorageProvider {
    storage_directory_path: PathBuf,
}

impl DiskSegmentStorageProvider {
    /// Creates a provider for the given directory, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(storage_directory_path: P) -> Result<Self, io::Error> {
        let storage_directory_path = storage_directory_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_directory_path)?;

        Ok(Self {
            storage_directory_path,
        })
    }

    pub fn storage_directory(&self) -> &Path {
        &self.storage_directory_path
    }

    /// Returns the backing file path for the segment with the given base offset.
    #[inline]
    pub fn segment_file_path(&self, base_offset: u64) -> PathBuf {
        self.storage_directory_path
            .join(format!("{base_offset:020}.{SEGMENT_FILE_EXTENSION}"))
    }
}

#[async_trait]
impl SegmentStorageProvider<FileStorage> for DiskSegmentStorageProvider {
    async fn base_offsets_of_stored_segments(&self) -> Result<Vec<u64>, FileStorageError> {
        let mut read_dir = tokio::fs::read_dir(&self.storage_directory_path).await?;

        let mut base_offsets = BinaryHeap::new();

        while let Some(dir_entry) = read_dir.next_entry().await? {
            let path = dir_entry.path();

            let base_offset = path
                .extension()
                .filter(|extension| *extension == SEGMENT_FILE_EXTENSION)
                .and(path.file_stem())
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok());

            if let Some(base_offset) = base_offset {
                base_offsets.push(base_offset);
            }
        }

        Ok(base_offsets.into_sorted_vec())
    }

    async fn obtain(&self, base_offset: u64) -> Result<FileStorage, FileStorageError> {
        tokio::fs::create_dir_all(&self.storage_directory_path).await?;

        FileStorage::new(self.segment_file_path(base_offset)).await
    }

    async fn remove_all(&self) -> Result<(), FileStorageError> {
        match tokio::fs::remove_dir_all(&self.storage_directory_path).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}
