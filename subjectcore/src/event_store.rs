//! Event store abstraction for the `SubjectCore` engine.
//!
//! This module defines the `EventStore` trait that serves as the port
//! interface for event store implementations. The engine never talks to a
//! storage backend directly: it reads finite, ordered event sequences for
//! state rebuilding, appends conditionally, and subscribes to the live feed
//! for event handling.

use crate::condition::{SourcingMode, SubjectCondition};
use crate::errors::EventStoreResult;
use crate::event::{Event, EventCandidate};
use crate::types::{EventId, Subject};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A lazy, potentially infinite sequence of appended events.
pub type EventStream = BoxStream<'static, EventStoreResult<Event>>;

/// Configuration for reading the events of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadOptions {
    /// Whether descendants of the subject are included
    pub mode: SourcingMode,
    /// Only return events with an id strictly greater than this one
    pub after: Option<EventId>,
}

impl ReadOptions {
    /// Creates read options for the given sourcing mode, starting at the beginning.
    pub const fn new(mode: SourcingMode) -> Self {
        Self { mode, after: None }
    }

    /// Restricts the read to events newer than `event_id`.
    #[must_use]
    pub const fn after(mut self, event_id: EventId) -> Self {
        self.after = Some(event_id);
        self
    }

    /// Applies an optional lower bound.
    #[must_use]
    pub const fn after_opt(mut self, event_id: Option<EventId>) -> Self {
        self.after = event_id;
        self
    }

    /// Returns `true` if an event on `subject` with `id` is selected by these
    /// options when reading `target`.
    pub fn selects(&self, target: &Subject, subject: &Subject, id: EventId) -> bool {
        let in_scope = match self.mode {
            SourcingMode::Local => subject == target,
            SourcingMode::Recursive => subject.is_self_or_descendant_of(target),
        };
        in_scope && self.after.map_or(true, |after| id > after)
    }
}

/// The event store capability consumed by the engine.
///
/// Implementations must assign strictly increasing [`EventId`]s in one global
/// order and evaluate the subject condition atomically with the append.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events, conditioned on the current state of `subject`.
    ///
    /// All candidates are written or none are. The condition is evaluated
    /// against the events recorded exactly on `subject`, atomically with the
    /// append.
    ///
    /// # Errors
    /// * `EventStoreError::ConditionViolation` - If the condition does not hold
    /// * `EventStoreError::Unavailable` - If the store cannot be reached
    async fn append(
        &self,
        subject: &Subject,
        condition: SubjectCondition,
        candidates: Vec<EventCandidate>,
    ) -> EventStoreResult<Vec<Event>>;

    /// Reads the events of a subject (or subtree) in global store order.
    ///
    /// The result is finite and every call replays from the beginning, or
    /// from `options.after` if set.
    async fn read_events(
        &self,
        subject: &Subject,
        options: &ReadOptions,
    ) -> EventStoreResult<Vec<Event>>;

    /// Subscribes to all events with an id greater than `after`, including
    /// events appended after the call.
    async fn subscribe(&self, after: Option<EventId>) -> EventStoreResult<EventStream>;

    /// Returns `true` if at least one event is recorded exactly on `subject`.
    async fn subject_exists(&self, subject: &Subject) -> EventStoreResult<bool> {
        let events = self
            .read_events(subject, &ReadOptions::new(SourcingMode::Local))
            .await?;
        Ok(!events.is_empty())
    }
}
