//! Progress tracking for event handling partitions.

use crate::errors::ProgressError;
use crate::types::EventId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identifies one partition of one processing group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    group: String,
    partition: u32,
}

impl PartitionKey {
    /// Creates the key of `partition` in `group`.
    pub fn new(group: impl Into<String>, partition: u32) -> Self {
        Self {
            group: group.into(),
            partition,
        }
    }

    /// The processing group.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The partition index.
    pub const fn partition(&self) -> u32 {
        self.partition
    }
}

impl std::fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.partition)
    }
}

/// An at-least-once checkpoint store for event handling.
///
/// After a restart, a worker resumes after the last committed event id of its
/// partition. Events handled but not yet committed are redelivered.
#[async_trait]
pub trait ProgressTracker: Send + Sync {
    /// Records that every event of the partition up to `event_id` is handled.
    async fn commit(&self, key: &PartitionKey, event_id: EventId) -> Result<(), ProgressError>;

    /// The last committed event id of the partition, if any.
    async fn last_committed(&self, key: &PartitionKey) -> Result<Option<EventId>, ProgressError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_displays_as_group_and_index() {
        let key = PartitionKey::new("lending", 3);

        assert_eq!(key.to_string(), "lending/3");
        assert_eq!(key.group(), "lending");
        assert_eq!(key.partition(), 3);
    }
}
