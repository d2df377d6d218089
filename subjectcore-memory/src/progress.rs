use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use subjectcore::errors::ProgressError;
use subjectcore::progress::{PartitionKey, ProgressTracker};
use subjectcore::types::EventId;

/// Progress checkpoints kept in memory.
///
/// Clones share the checkpoints, so a restarted processor built from a clone
/// resumes where the previous one stopped.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProgressTracker {
    committed: Arc<RwLock<HashMap<PartitionKey, EventId>>>,
}

impl InMemoryProgressTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// The last committed event id of `key`.
    pub fn committed(&self, key: &PartitionKey) -> Option<EventId> {
        self.committed.read().get(key).copied()
    }
}

#[async_trait]
impl ProgressTracker for InMemoryProgressTracker {
    async fn commit(&self, key: &PartitionKey, event_id: EventId) -> Result<(), ProgressError> {
        self.committed
            .write()
            .entry(key.clone())
            .and_modify(|committed| *committed = (*committed).max(event_id))
            .or_insert(event_id);
        Ok(())
    }

    async fn last_committed(&self, key: &PartitionKey) -> Result<Option<EventId>, ProgressError> {
        Ok(self.committed(key))
    }
}
