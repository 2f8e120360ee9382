//! Module providing [`Topic`], a named registry of partitions stored under one directory.

use super::{validate_name, CacheError, DiskPartition};
use crate::{
    commit_log::segmented_log::config::SegmentedLogConfig,
    storage::impls::tokio::DiskSegmentStorageProvider,
};
use dashmap::DashMap;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A named collection of partitions.
///
/// Every partition lives in its own subdirectory of the topic directory. Structural changes
/// (adding, removing and clearing partitions) are serialized; lookups never wait on them.
pub struct Topic {
    name: String,
    directory: PathBuf,
    log_config: SegmentedLogConfig,

    partitions: DashMap<String, Arc<DiskPartition>>,

    /// Serializes structural changes. Set once the topic is removed.
    structure_lock: Mutex<bool>,
}

impl Topic {
    /// Creates the topic with the given name, creating its directory if needed.
    pub async fn new(
        name: String,
        directory: PathBuf,
        log_config: SegmentedLogConfig,
    ) -> Result<Self, CacheError> {
        tokio::fs::create_dir_all(&directory)
            .await
            .map_err(CacheError::IoError)?;

        Ok(Self {
            name,
            directory,
            log_config,
            partitions: DashMap::new(),
            structure_lock: Mutex::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn partition(&self, key: &str) -> Option<Arc<DiskPartition>> {
        self.partitions.get(key).map(|partition| partition.value().clone())
    }

    /// Keys of all partitions, sorted.
    pub fn partition_keys(&self) -> Vec<String> {
        let mut keys = self
            .partitions
            .iter()
            .map(|partition| partition.key().clone())
            .collect::<Vec<_>>();

        keys.sort_unstable();
        keys
    }

    /// Point in time copy of the partition registry, sorted by key.
    pub fn partitions(&self) -> Vec<(String, Arc<DiskPartition>)> {
        let mut partitions = self
            .partitions
            .iter()
            .map(|partition| (partition.key().clone(), partition.value().clone()))
            .collect::<Vec<_>>();

        partitions.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        partitions
    }

    async fn open_partition(&self, key: &str) -> Result<Arc<DiskPartition>, CacheError> {
        let provider = DiskSegmentStorageProvider::new(self.directory.join(key))
            .map_err(CacheError::IoError)?;

        let partition = DiskPartition::new(key, self.log_config.clone(), provider)
            .await
            .map_err(|source| CacheError::PartitionError {
                topic: self.name.clone(),
                partition: key.to_string(),
                source,
            })?;

        Ok(Arc::new(partition))
    }

    /// Adds a new, empty partition.
    ///
    /// ## Errors
    /// - [`CacheError::PartitionExists`]: if the partition is already registered.
    /// - [`CacheError::InvalidName`]: if the key cannot be used as a directory name.
    pub async fn add_partition(&self, key: &str) -> Result<Arc<DiskPartition>, CacheError> {
        validate_name(key)?;

        let removed = self.structure_lock.lock().await;

        if *removed {
            return Err(CacheError::UnknownTopic(self.name.clone()));
        }

        if self.partitions.contains_key(key) {
            return Err(CacheError::PartitionExists {
                topic: self.name.clone(),
                partition: key.to_string(),
            });
        }

        let partition = self.open_partition(key).await?;
        self.partitions.insert(key.to_string(), partition.clone());

        debug!(topic = %self.name, partition = key, "added partition");

        Ok(partition)
    }

    /// Returns the partition with the given key, adding it first if it is not registered.
    ///
    /// The returned flag states whether the partition was added.
    pub async fn get_or_add_partition(
        &self,
        key: &str,
    ) -> Result<(Arc<DiskPartition>, bool), CacheError> {
        if let Some(partition) = self.partition(key) {
            return Ok((partition, false));
        }

        match self.add_partition(key).await {
            Ok(partition) => Ok((partition, true)),
            Err(CacheError::PartitionExists { .. }) => self
                .partition(key)
                .map(|partition| (partition, false))
                .ok_or_else(|| CacheError::UnknownPartition {
                    topic: self.name.clone(),
                    partition: key.to_string(),
                }),
            Err(error) => Err(error),
        }
    }

    /// Unregisters the partition with the given key and deletes its data.
    pub async fn remove_partition(&self, key: &str) -> Result<(), CacheError> {
        let _structure_guard = self.structure_lock.lock().await;

        let (_, partition) =
            self.partitions
                .remove(key)
                .ok_or_else(|| CacheError::UnknownPartition {
                    topic: self.name.clone(),
                    partition: key.to_string(),
                })?;

        partition
            .remove()
            .await
            .map_err(|source| CacheError::PartitionError {
                topic: self.name.clone(),
                partition: key.to_string(),
                source,
            })?;

        debug!(topic = %self.name, partition = key, "removed partition");

        Ok(())
    }

    /// Discards every entry of the partition with the given key, keeping it registered.
    pub async fn clear_partition(&self, key: &str) -> Result<(), CacheError> {
        let _structure_guard = self.structure_lock.lock().await;

        let partition = self
            .partition(key)
            .ok_or_else(|| CacheError::UnknownPartition {
                topic: self.name.clone(),
                partition: key.to_string(),
            })?;

        partition
            .clear()
            .await
            .map_err(|source| CacheError::PartitionError {
                topic: self.name.clone(),
                partition: key.to_string(),
                source,
            })
    }

    /// Registers every partition found on disk that is not registered yet.
    pub async fn fill(&self) -> Result<(), CacheError> {
        let _structure_guard = self.structure_lock.lock().await;

        for key in subdirectory_names(&self.directory).await? {
            if self.partitions.contains_key(&key) {
                continue;
            }

            let partition = self.open_partition(&key).await?;
            let entries = partition.len().await;

            info!(topic = %self.name, partition = %key, entries, "restored partition");

            self.partitions.insert(key, partition);
        }

        Ok(())
    }

    /// Deletes every partition along with the topic directory.
    ///
    /// All partitions are attempted; the first error is returned.
    pub async fn remove(&self) -> Result<(), CacheError> {
        let mut removed = self.structure_lock.lock().await;
        *removed = true;

        let mut remove_result = Ok(());

        for key in self.partition_keys() {
            if let Some((_, partition)) = self.partitions.remove(&key) {
                if let Err(source) = partition.remove().await {
                    warn!(
                        topic = %self.name,
                        partition = %key,
                        "unable to remove partition: {}",
                        source
                    );

                    if remove_result.is_ok() {
                        remove_result = Err(CacheError::PartitionError {
                            topic: self.name.clone(),
                            partition: key,
                            source,
                        });
                    }
                }
            }
        }

        remove_result?;

        match tokio::fs::remove_dir_all(&self.directory).await {
            Err(error) if error.kind() != io::ErrorKind::NotFound => {
                Err(CacheError::IoError(error))
            }
            _ => Ok(()),
        }
    }
}

/// Names of the subdirectories of the given directory which are usable as topic or
/// partition names.
pub(super) async fn subdirectory_names(directory: &Path) -> Result<Vec<String>, CacheError> {
    let mut read_dir = tokio::fs::read_dir(directory)
        .await
        .map_err(CacheError::IoError)?;

    let mut names = Vec::new();

    while let Some(dir_entry) = read_dir.next_entry().await.map_err(CacheError::IoError)? {
        if !dir_entry
            .file_type()
            .await
            .map_err(CacheError::IoError)?
            .is_dir()
        {
            continue;
        }

        match dir_entry.file_name().into_string() {
            Ok(name) if validate_name(&name).is_ok() => names.push(name),
            other => warn!(entry = ?other, "skipping unusable directory"),
        }
    }

    names.sort_unstable();

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::partition::test::_gen_data;

    #[tokio::test]
    async fn test_topic_partition_registry() {
        const TEST_TOPIC_DIRECTORY: &str = "/tmp/slait_test_topic_partition_registry";

        if Path::new(TEST_TOPIC_DIRECTORY).exists() {
            tokio::fs::remove_dir_all(TEST_TOPIC_DIRECTORY).await.unwrap();
        }

        let topic = Topic::new(
            "bars".to_string(),
            PathBuf::from(TEST_TOPIC_DIRECTORY),
            SegmentedLogConfig::default(),
        )
        .await
        .unwrap();

        for key in ["TSLA_bats", "AAPL_bats"] {
            topic.add_partition(key).await.unwrap();
        }

        let (partition, created) = topic.get_or_add_partition("AAPL_bats").await.unwrap();
        assert!(!created);

        let mut data = _gen_data();
        partition.append(&mut data).await.unwrap();

        let (_, created) = topic.get_or_add_partition("MSFT_bats").await.unwrap();
        assert!(created);

        assert_eq!(
            topic.partition_keys(),
            vec!["AAPL_bats", "MSFT_bats", "TSLA_bats"]
        );

        // stray files and unusable names are not partitions
        tokio::fs::write(Path::new(TEST_TOPIC_DIRECTORY).join("notes.txt"), b"ignored")
            .await
            .unwrap();
        assert_eq!(
            subdirectory_names(topic.directory()).await.unwrap(),
            vec!["AAPL_bats", "MSFT_bats", "TSLA_bats"]
        );

        topic.clear_partition("AAPL_bats").await.unwrap();
        assert_eq!(partition.len().await, 0);

        assert!(matches!(
            topic.remove_partition("GOOG_bats").await,
            Err(CacheError::UnknownPartition { .. })
        ));

        topic.remove_partition("TSLA_bats").await.unwrap();
        assert!(topic.partition("TSLA_bats").is_none());
        assert!(!Path::new(TEST_TOPIC_DIRECTORY).join("TSLA_bats").exists());

        topic.remove().await.unwrap();
        assert!(topic.partition_keys().is_empty());
        assert!(!Path::new(TEST_TOPIC_DIRECTORY).exists());

        // a removed topic takes no new partitions
        assert!(matches!(
            topic.add_partition("TSLA_bats").await,
            Err(CacheError::UnknownTopic(_))
        ));
        assert!(!Path::new(TEST_TOPIC_DIRECTORY).exists());
    }
}
