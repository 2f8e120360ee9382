//! A time-series ingestion cache.
//!
//! Producers append timestamped, opaque payloads to partitions of named topics; consumers read
//! time ranged slices back and subscribe to live changes. Every partition is stored in a
//! segmented, append-only commit log with age or size based retention.
//!
//! ```text
//! Cache::append ──> Topic ──> Partition ──> SegmentedLog ──> Segment ──> Store ──> Storage
//!       │
//!       └──> Router ──> Publication / Addition / Removal subscribers
//! ```

pub mod cache;
pub mod commit_log;
pub mod common;
pub mod config;
pub mod router;
pub mod storage;

pub mod prelude {
    //! Prelude module for [`slait`](super) with common exports for convenience.

    pub use super::cache::{Cache, CacheError, Catalog, LastCommit, TopicOp};
    pub use super::commit_log::{Entries, Entry};
    pub use super::config::{CacheConfig, LogConfig};
    pub use super::router::{Addition, Publication, Removal, Router};
}
