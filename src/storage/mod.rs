//! Module providing the byte-storage seam beneath our commit log.
//!
//! A [`Storage`] is a growable, truncatable, append-only byte region. Segments of a commit log
//! are laid on top of one [`Storage`] each, while a [`SegmentStorageProvider`] decides where
//! (and if) such storages persist.

use async_trait::async_trait;
use std::sync::Arc;

/// Something with a size in bytes.
pub trait Sizable {
    /// Returns the current size in bytes.
    fn size(&self) -> u64;
}

#[async_trait]
pub trait AsyncTruncate {
    type Mark;

    type TruncError: std::error::Error;

    /// Discards everything from the given mark onwards.
    async fn truncate(&mut self, mark: &Self::Mark) -> Result<(), Self::TruncError>;
}

#[async_trait]
pub trait AsyncConsume {
    type ConsumeError: std::error::Error;

    /// Releases all held resources and deletes the underlying data.
    async fn remove(self) -> Result<(), Self::ConsumeError>;

    /// Releases all held resources without deleting any data.
    async fn close(self) -> Result<(), Self::ConsumeError>;
}

/// An append-only byte region which can be read from any position lying in its written area.
#[async_trait]
pub trait Storage:
    AsyncTruncate<Mark = u64, TruncError = Self::Error>
    + AsyncConsume<ConsumeError = Self::Error>
    + Sizable
    + Send
    + Sync
    + Sized
    + 'static
{
    type Error: std::error::Error + Send + Sync + 'static;

    /// Appends the given slice at the end of this storage.
    ///
    /// Returns the position at which the slice was written along with the number of bytes
    /// written.
    async fn append_slice(&mut self, slice: &[u8]) -> Result<(u64, u64), Self::Error>;

    /// Reads exactly `size` bytes starting at `position`.
    async fn read(&self, position: u64, size: u64) -> Result<Vec<u8>, Self::Error>;

    /// Pushes appended bytes that are still buffered in memory down to the backing medium.
    async fn flush(&mut self) -> Result<(), Self::Error>;

    /// Number of appended bytes which have not been pushed to the backing medium yet.
    fn unflushed(&self) -> u64;

    /// Whether data in this storage outlives the storage instance.
    fn is_persistent() -> bool;
}

/// Provides storages for the segments of a single commit log, addressed by segment base offset.
#[async_trait]
pub trait SegmentStorageProvider<S>: Send + Sync
where
    S: Storage,
{
    /// Returns the base offsets of all segments already persisted, in ascending order.
    async fn base_offsets_of_stored_segments(&self) -> Result<Vec<u64>, S::Error>;

    /// Opens (creating if necessary) the storage for the segment with the given base offset.
    async fn obtain(&self, base_offset: u64) -> Result<S, S::Error>;

    /// Deletes whatever container holds the segment storages of this log.
    async fn remove_all(&self) -> Result<(), S::Error>;
}

#[async_trait]
impl<S, P> SegmentStorageProvider<S> for Arc<P>
where
    S: Storage,
    P: SegmentStorageProvider<S> + ?Sized,
{
    async fn base_offsets_of_stored_segments(&self) -> Result<Vec<u64>, S::Error> {
        self.as_ref().base_offsets_of_stored_segments().await
    }

    async fn obtain(&self, base_offset: u64) -> Result<S, S::Error> {
        self.as_ref().obtain(base_offset).await
    }

    async fn remove_all(&self) -> Result<(), S::Error> {
        self.as_ref().remove_all().await
    }
}

pub mod impls;
