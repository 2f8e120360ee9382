//! In-process publish/subscribe bus for cache change notifications.
//!
//! The [`Router`] carries three independent event streams: [`Publication`]s of freshly appended
//! entries, [`Addition`]s and [`Removal`]s of topics and partitions. Every stream is a
//! [`tokio::sync::broadcast`] channel:
//!
//! - publishing never blocks, and an event published while nobody is subscribed is dropped
//! - every subscriber receives its own copy of every event published after it subscribed
//! - a subscriber lagging more than `capacity` events behind loses the oldest events and
//!   observes [`RecvError::Lagged`](tokio::sync::broadcast::error::RecvError::Lagged)
//!
//! Filtering by topic or partition is left to subscribers.

use super::commit_log::Entries;
use serde::Serialize;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::trace;

/// Default number of events buffered per stream.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Entries appended to a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Publication {
    pub topic: String,
    pub partition: String,
    pub entries: Entries,
}

/// A topic, or a partition within a topic, was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Addition {
    pub topic: String,
    pub partition: Option<String>,
}

/// A topic, or a partition within a topic, was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Removal {
    pub topic: String,
    pub partition: Option<String>,
}

#[derive(Debug)]
pub struct Router {
    publications: Sender<Publication>,
    additions: Sender<Addition>,
    removals: Sender<Removal>,
}

impl Router {
    /// Creates a router buffering up to `capacity` events per stream and subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);

        Self {
            publications: broadcast::channel(capacity).0,
            additions: broadcast::channel(capacity).0,
            removals: broadcast::channel(capacity).0,
        }
    }

    pub fn publish(&self, publication: Publication) {
        if let Err(broadcast::error::SendError(publication)) = self.publications.send(publication) {
            trace!(
                topic = %publication.topic,
                partition = %publication.partition,
                "dropped publication without subscribers"
            );
        }
    }

    pub fn publish_addition(&self, addition: Addition) {
        if let Err(broadcast::error::SendError(addition)) = self.additions.send(addition) {
            trace!(
                topic = %addition.topic,
                partition = ?addition.partition,
                "dropped addition without subscribers"
            );
        }
    }

    pub fn publish_removal(&self, removal: Removal) {
        if let Err(broadcast::error::SendError(removal)) = self.removals.send(removal) {
            trace!(
                topic = %removal.topic,
                partition = ?removal.partition,
                "dropped removal without subscribers"
            );
        }
    }

    /// Subscribes to publications.
    pub fn pull(&self) -> Receiver<Publication> {
        self.publications.subscribe()
    }

    /// Subscribes to additions.
    pub fn pull_additions(&self) -> Receiver<Addition> {
        self.additions.subscribe()
    }

    /// Subscribes to removals.
    pub fn pull_removals(&self) -> Receiver<Removal> {
        self.removals.subscribe()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
