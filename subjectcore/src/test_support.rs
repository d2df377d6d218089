//! A minimal event store for unit tests inside this crate.
//!
//! Hosts and integration tests use `subjectcore-memory` instead.

use crate::condition::SubjectCondition;
use crate::errors::{EventStoreError, EventStoreResult, ProgressError};
use crate::event::{DomainEvent, Event, EventCandidate, Metadata};
use crate::event_store::{EventStore, EventStream, ReadOptions};
use crate::progress::{PartitionKey, ProgressTracker};
use crate::types::{EventId, EventType, Subject, Timestamp};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub fn candidate<E: DomainEvent>(subject: &Subject, payload: serde_json::Value) -> EventCandidate {
    EventCandidate {
        subject: subject.clone(),
        event_type: EventType::try_new(E::EVENT_TYPE).unwrap(),
        payload,
        metadata: Metadata::new(),
    }
}

#[derive(Default)]
pub struct VecEventStore {
    events: Mutex<Vec<Event>>,
    fail_reads: AtomicBool,
    fail_appends: AtomicBool,
    reads: AtomicUsize,
}

impl VecEventStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventStore for VecEventStore {
    async fn append(
        &self,
        subject: &Subject,
        condition: SubjectCondition,
        candidates: Vec<EventCandidate>,
    ) -> EventStoreResult<Vec<Event>> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(EventStoreError::Unavailable("appends disabled".to_string()));
        }
        let mut events = self.events.lock();
        let exists = events.iter().any(|event| &event.subject == subject);
        if !condition.matches(exists) {
            return Err(EventStoreError::ConditionViolation {
                subject: subject.clone(),
                condition,
            });
        }
        let mut next = events.last().map_or_else(EventId::first, |last| last.id.next());
        let mut appended = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let event = candidate.into_event(next, "tests", Timestamp::now());
            next = next.next();
            appended.push(event);
        }
        events.extend(appended.iter().cloned());
        Ok(appended)
    }

    async fn read_events(
        &self,
        subject: &Subject,
        options: &ReadOptions,
    ) -> EventStoreResult<Vec<Event>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EventStoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(self
            .events
            .lock()
            .iter()
            .filter(|event| options.selects(subject, &event.subject, event.id))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, after: Option<EventId>) -> EventStoreResult<EventStream> {
        let snapshot: Vec<_> = self
            .events
            .lock()
            .iter()
            .filter(|event| after.map_or(true, |after| event.id > after))
            .cloned()
            .map(Ok)
            .collect();
        Ok(Box::pin(futures::stream::iter(snapshot)))
    }
}

#[derive(Default)]
pub struct MapProgressTracker {
    committed: Mutex<HashMap<PartitionKey, EventId>>,
}

impl MapProgressTracker {
    pub fn committed(&self, key: &PartitionKey) -> Option<EventId> {
        self.committed.lock().get(key).copied()
    }
}

#[async_trait]
impl ProgressTracker for MapProgressTracker {
    async fn commit(&self, key: &PartitionKey, event_id: EventId) -> Result<(), ProgressError> {
        self.committed.lock().insert(key.clone(), event_id);
        Ok(())
    }

    async fn last_committed(&self, key: &PartitionKey) -> Result<Option<EventId>, ProgressError> {
        Ok(self.committed(key))
    }
}
