//! Module providing the [`Cache`], the registry of topics and partitions at the top of the
//! storage hierarchy.
//!
//! ```text
//! Cache ── topic name ──> Topic ── partition key ──> Partition ──> SegmentedLog ──> Segment*
//! ```
//!
//! On disk, every topic is a directory under the data directory and every partition a
//! subdirectory of its topic holding the partition's segment files. [`Cache::fill`] rebuilds the
//! hierarchy from that layout on startup.
//!
//! Every successful mutation is announced on the [`Router`]: appends as [`Publication`]s, added
//! topics and partitions as [`Addition`]s, removed ones as [`Removal`]s.

pub mod partition;
pub mod topic;

use self::{
    partition::{Partition, PartitionError},
    topic::{subdirectory_names, Topic},
};
use super::{
    commit_log::{
        segmented_log::cleaner::{Cleaner, CleanerError},
        Entries, Entry,
    },
    config::{CacheConfig, LogConfig},
    router::{Addition, Publication, Removal, Router},
    storage::impls::tokio::{DiskSegmentStorageProvider, FileStorage, FileStorageError},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt::Display,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// [`Partition`] stored in segment files on disk.
pub type DiskPartition = Partition<FileStorage, DiskSegmentStorageProvider>;

pub type DiskPartitionError = PartitionError<FileStorageError>;

/// Topic name -> partition key -> number of entries.
pub type Catalog = BTreeMap<String, BTreeMap<String, usize>>;

#[derive(Debug)]
pub enum CacheError {
    TopicExists(String),
    UnknownTopic(String),
    PartitionExists { topic: String, partition: String },
    UnknownPartition { topic: String, partition: String },

    /// The name cannot be used as a topic or partition directory name.
    InvalidName(String),

    /// The operation code does not map to a [`TopicOp`].
    UnknownOperation(i32),

    /// The retention policy of the log configuration cannot be built.
    InvalidLogConfig(CleanerError),

    IoError(io::Error),

    /// An operation on a partition failed.
    PartitionError {
        topic: String,
        partition: String,
        source: DiskPartitionError,
    },
}

impl Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TopicExists(topic) => write!(f, "Topic {} already exists", topic),
            Self::UnknownTopic(topic) => write!(f, "Topic {} does not exist", topic),
            Self::PartitionExists { topic, partition } => {
                write!(f, "Partition {} already exists in topic {}", partition, topic)
            }
            Self::UnknownPartition { topic, partition } => {
                write!(f, "Partition {} does not exist in topic {}", partition, topic)
            }
            Self::InvalidName(name) => write!(f, "Invalid topic or partition name {:?}", name),
            Self::UnknownOperation(op) => write!(f, "Unknown topic operation {}", op),
            Self::InvalidLogConfig(err) => write!(f, "Invalid log configuration: {}", err),
            Self::IoError(err) => write!(f, "IO error occurred: {}", err),
            Self::PartitionError {
                topic,
                partition,
                source,
            } => write!(f, "{} (topic: {}, partition: {})", source, topic, partition),
        }
    }
}

impl StdError for CacheError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::InvalidLogConfig(err) => Some(err),
            Self::IoError(err) => Some(err),
            Self::PartitionError { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Checks that the given name can be used as a topic or partition directory name.
pub(crate) fn validate_name(name: &str) -> Result<(), CacheError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        Err(CacheError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Structural operation on the partitions of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TopicOp {
    AddPartition = 0,
    RemovePartition = 1,
    ClearPartition = 2,
}

impl TryFrom<i32> for TopicOp {
    type Error = CacheError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AddPartition),
            1 => Ok(Self::RemovePartition),
            2 => Ok(Self::ClearPartition),
            _ => Err(CacheError::UnknownOperation(value)),
        }
    }
}

/// The most recently appended entry across the whole cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastCommit {
    /// `<topic>_<partition>`
    pub key: String,
    pub timestamp: DateTime<Utc>,
}

/// Registry of topics stored under one data directory.
///
/// Lookups go through concurrent maps and never wait on structural changes. Adding and removing
/// topics is serialized at the cache level, partition level changes at the topic level, and
/// appends to one partition at the partition level.
pub struct Cache {
    data_dir: PathBuf,
    log_config: LogConfig,

    topics: DashMap<String, Arc<Topic>>,
    structure_lock: Mutex<()>,

    router: Arc<Router>,
}

impl Cache {
    /// Creates an empty cache over the configured data directory, creating the directory if
    /// needed. Data already on disk is loaded by [`Cache::fill`].
    ///
    /// ## Errors
    /// - [`CacheError::InvalidLogConfig`]: if the retention policy cannot be built.
    /// - [`CacheError::IoError`]: if the data directory cannot be created.
    pub async fn new(config: &CacheConfig, router: Arc<Router>) -> Result<Self, CacheError> {
        Cleaner::from_options(&config.log.cleaner).map_err(CacheError::InvalidLogConfig)?;

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(CacheError::IoError)?;

        Ok(Self {
            data_dir: config.data_dir.clone(),
            log_config: config.log.clone(),
            topics: DashMap::new(),
            structure_lock: Mutex::new(()),
            router,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|topic| topic.value().clone())
    }

    /// Names of all topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names = self
            .topics
            .iter()
            .map(|topic| topic.key().clone())
            .collect::<Vec<_>>();

        names.sort_unstable();
        names
    }

    /// Keys of all partitions of the given topic, sorted.
    pub fn partitions(&self, topic: &str) -> Option<Vec<String>> {
        self.topic(topic).map(|topic| topic.partition_keys())
    }

    fn topic_snapshot(&self) -> Vec<Arc<Topic>> {
        let mut topics = self
            .topics
            .iter()
            .map(|topic| topic.value().clone())
            .collect::<Vec<_>>();

        topics.sort_unstable_by(|a, b| a.name().cmp(b.name()));
        topics
    }

    fn known_topic(&self, name: &str) -> Result<Arc<Topic>, CacheError> {
        self.topic(name)
            .ok_or_else(|| CacheError::UnknownTopic(name.to_string()))
    }

    #[instrument(skip(self))]
    pub async fn add_topic(&self, name: &str) -> Result<(), CacheError> {
        validate_name(name)?;

        let _structure_guard = self.structure_lock.lock().await;

        if self.topics.contains_key(name) {
            return Err(CacheError::TopicExists(name.to_string()));
        }

        let topic = Topic::new(
            name.to_string(),
            self.data_dir.join(name),
            self.log_config.clone(),
        )
        .await?;

        self.topics.insert(name.to_string(), Arc::new(topic));

        info!("added topic");

        self.router.publish_addition(Addition {
            topic: name.to_string(),
            partition: None,
        });

        Ok(())
    }

    /// Unregisters the given topic and deletes all of its partitions.
    #[instrument(skip(self))]
    pub async fn remove_topic(&self, name: &str) -> Result<(), CacheError> {
        let _structure_guard = self.structure_lock.lock().await;

        let (_, topic) = self
            .topics
            .remove(name)
            .ok_or_else(|| CacheError::UnknownTopic(name.to_string()))?;

        // the topic directory must be gone before the name can be added again
        let remove_result = topic.remove().await;

        info!("removed topic");

        self.router.publish_removal(Removal {
            topic: name.to_string(),
            partition: None,
        });

        remove_result
    }

    /// Applies the given structural operation to a partition of the given topic.
    ///
    /// ## Errors
    /// - [`CacheError::UnknownTopic`]: if the topic does not exist.
    /// - [`CacheError::PartitionExists`]: when adding a partition that already exists.
    /// - [`CacheError::UnknownPartition`]: when removing or clearing a missing partition.
    #[instrument(skip(self))]
    pub async fn update_topic(
        &self,
        topic: &str,
        partition: &str,
        op: TopicOp,
    ) -> Result<(), CacheError> {
        let topic_ref = self.known_topic(topic)?;

        match op {
            TopicOp::AddPartition => {
                topic_ref.add_partition(partition).await?;

                self.router.publish_addition(Addition {
                    topic: topic.to_string(),
                    partition: Some(partition.to_string()),
                });
            }
            TopicOp::RemovePartition => {
                topic_ref.remove_partition(partition).await?;

                self.router.publish_removal(Removal {
                    topic: topic.to_string(),
                    partition: Some(partition.to_string()),
                });
            }
            TopicOp::ClearPartition => topic_ref.clear_partition(partition).await?,
        }

        Ok(())
    }

    /// Appends the given batch to a partition of the given topic, adding the partition first if
    /// it does not exist yet.
    ///
    /// Unstamped entries are stamped in place. See [`Partition::append`].
    #[instrument(skip(self, entries), fields(entries = entries.len()))]
    pub async fn append(
        &self,
        topic: &str,
        partition: &str,
        entries: &mut [Entry],
    ) -> Result<(), CacheError> {
        let topic_ref = self.known_topic(topic)?;

        let (partition_ref, created) = topic_ref.get_or_add_partition(partition).await?;

        if created {
            debug!("added partition on first append");

            self.router.publish_addition(Addition {
                topic: topic.to_string(),
                partition: Some(partition.to_string()),
            });
        }

        partition_ref
            .append(entries)
            .await
            .map_err(|source| CacheError::PartitionError {
                topic: topic.to_string(),
                partition: partition.to_string(),
                source,
            })?;

        self.router.publish(Publication {
            topic: topic.to_string(),
            partition: partition.to_string(),
            entries: entries.to_vec(),
        });

        Ok(())
    }

    async fn read_partition(
        topic: &str,
        partition: &DiskPartition,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        last: usize,
    ) -> Result<Option<Entries>, CacheError> {
        match partition.get(from, to, last).await {
            Ok(entries) => Ok(entries),
            Err(PartitionError::Removed) => Ok(None),
            Err(source) => Err(CacheError::PartitionError {
                topic: topic.to_string(),
                partition: partition.key().to_string(),
                source,
            }),
        }
    }

    /// Reads entries from a partition. See [`Partition::get`].
    ///
    /// Returns [`None`] if the topic or the partition does not exist.
    pub async fn get(
        &self,
        topic: &str,
        partition: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        last: usize,
    ) -> Result<Option<Entries>, CacheError> {
        match self.topic(topic).and_then(|topic| topic.partition(partition)) {
            Some(partition) => Self::read_partition(topic, &partition, from, to, last).await,
            None => Ok(None),
        }
    }

    /// Reads entries from every partition of a topic. See [`Partition::get`].
    ///
    /// Partitions without matching entries map to an empty sequence; partitions for which the
    /// range is inverted are left out. Returns [`None`] if the topic does not exist.
    pub async fn get_all(
        &self,
        topic: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        last: usize,
    ) -> Result<Option<BTreeMap<String, Entries>>, CacheError> {
        let topic_ref = match self.topic(topic) {
            Some(topic_ref) => topic_ref,
            None => return Ok(None),
        };

        let mut entries_by_partition = BTreeMap::new();

        for (key, partition) in topic_ref.partitions() {
            if let Some(entries) = Self::read_partition(topic, &partition, from, to, last).await? {
                entries_by_partition.insert(key, entries);
            }
        }

        Ok(Some(entries_by_partition))
    }

    /// Number of entries in every partition of every topic.
    pub async fn catalog(&self) -> Catalog {
        let mut catalog = Catalog::new();

        for topic in self.topic_snapshot() {
            let mut counts = BTreeMap::new();

            for (key, partition) in topic.partitions() {
                counts.insert(key, partition.len().await);
            }

            catalog.insert(topic.name().to_string(), counts);
        }

        catalog
    }

    /// Locates the newest entry across all partitions. [`None`] if every partition is empty.
    pub async fn last_commit(&self) -> Option<LastCommit> {
        let mut last_commit: Option<LastCommit> = None;

        for topic in self.topic_snapshot() {
            for (key, partition) in topic.partitions() {
                let timestamp = match partition.last_timestamp().await {
                    Some(timestamp) => timestamp,
                    None => continue,
                };

                if last_commit
                    .as_ref()
                    .map_or(true, |last_commit| timestamp > last_commit.timestamp)
                {
                    last_commit = Some(LastCommit {
                        key: format!("{}_{}", topic.name(), key),
                        timestamp,
                    });
                }
            }
        }

        last_commit
    }

    /// Number of appended bytes across all partitions not yet flushed to their segment files.
    ///
    /// Every append flushes on completion, so this is 0 whenever no append is in flight.
    pub async fn size(&self) -> u64 {
        let mut size = 0;

        for topic in self.topic_snapshot() {
            for (_, partition) in topic.partitions() {
                size += partition.unflushed().await;
            }
        }

        size
    }

    async fn trim_partitions(topic: &Topic) {
        for (key, partition) in topic.partitions() {
            match partition.trim().await {
                Ok(Some(cutoff)) => info!(
                    topic = %topic.name(),
                    partition = %key,
                    cutoff = %cutoff.to_rfc3339(),
                    "trimmed partition"
                ),
                Ok(None) | Err(PartitionError::Removed) => {}
                Err(error) => warn!(
                    topic = %topic.name(),
                    partition = %key,
                    "unable to trim partition: {}",
                    error
                ),
            }
        }
    }

    /// Applies the retention policy to every partition.
    ///
    /// Partitions are trimmed one at a time. A failure is logged and does not stop the sweep.
    #[instrument(skip(self))]
    pub async fn trim(&self) {
        for topic in self.topic_snapshot() {
            Self::trim_partitions(&topic).await;
        }
    }

    /// Applies the retention policy to every partition of the given topic. Does nothing if the
    /// topic does not exist.
    #[instrument(skip(self))]
    pub async fn trim_topic(&self, topic: &str) {
        if let Some(topic) = self.topic(topic) {
            Self::trim_partitions(&topic).await;
        }
    }

    /// Spawns a task trimming the whole cache once every `period`.
    ///
    /// The task holds no strong reference to the cache and stops once the cache is dropped.
    pub fn spawn_trimmer(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);

        tokio::spawn(
            async move {
                let mut interval = time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

                // the first tick completes immediately
                interval.tick().await;

                loop {
                    interval.tick().await;

                    match cache.upgrade() {
                        Some(cache) => cache.trim().await,
                        None => break,
                    }
                }

                debug!("cache dropped, trimmer exiting");
            }
            .instrument(info_span!("cache_trimmer")),
        )
    }

    /// Loads every topic and partition found in the data directory.
    ///
    /// Existing entries are made readable as they are stored; they are neither validated nor
    /// announced on the router. Topics and partitions already registered are kept.
    #[instrument(skip(self))]
    pub async fn fill(&self) -> Result<(), CacheError> {
        let _structure_guard = self.structure_lock.lock().await;

        for name in subdirectory_names(&self.data_dir).await? {
            let topic = match self.topic(&name) {
                Some(topic) => topic,
                None => {
                    let topic = Topic::new(
                        name.clone(),
                        self.data_dir.join(&name),
                        self.log_config.clone(),
                    )
                    .await?;

                    Arc::new(topic)
                }
            };

            topic.fill().await?;

            self.topics.insert(name, topic);
        }

        info!(topics = self.topics.len(), "filled cache");

        Ok(())
    }

    /// Flushes every partition and releases its storage without deleting any data.
    ///
    /// All partitions are attempted; the first error is returned. The cache is empty afterwards.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), CacheError> {
        let _structure_guard = self.structure_lock.lock().await;

        let mut close_result = Ok(());

        for topic in self.topic_snapshot() {
            self.topics.remove(topic.name());

            for (key, partition) in topic.partitions() {
                if let Err(source) = partition.close().await {
                    warn!(
                        topic = %topic.name(),
                        partition = %key,
                        "unable to close partition: {}",
                        source
                    );

                    if close_result.is_ok() {
                        close_result = Err(CacheError::PartitionError {
                            topic: topic.name().to_string(),
                            partition: key,
                            source,
                        });
                    }
                }
            }
        }

        close_result
    }
}
