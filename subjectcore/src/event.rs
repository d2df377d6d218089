//! Event types for the engine.
//!
//! Events are immutable records of facts. [`EventCandidate`] is what a command
//! handler publishes; the event store turns it into an [`Event`] by assigning
//! an [`EventId`] and a timestamp. Payloads travel as JSON values so the store
//! and the upcaster chain never need to know the Rust payload types.

use crate::types::{EventId, EventType, Subject, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key/value metadata attached to an event.
pub type Metadata = HashMap<String, serde_json::Value>;

/// A typed event payload.
///
/// Implementors name the event type under which their payload is stored and
/// are (de)serialized with serde.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The stored event type, e.g. `com.example.book.added.v1`.
    const EVENT_TYPE: &'static str;
}

/// An event as stored in the event store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the store's global order
    pub id: EventId,
    /// The subject the event was recorded on
    pub subject: Subject,
    /// The event type name
    pub event_type: EventType,
    /// The application that produced the event
    pub source: String,
    /// The event payload
    pub payload: serde_json::Value,
    /// Metadata attached at publication time
    #[serde(default)]
    pub metadata: Metadata,
    /// When the store recorded the event
    pub time: Timestamp,
}

impl Event {
    /// Returns `true` if the event is of the given type.
    pub fn is_type(&self, event_type: &str) -> bool {
        self.event_type.as_ref() == event_type
    }

    /// Deserializes the payload into a typed domain event.
    pub fn payload_as<E: DomainEvent>(&self) -> Result<E, serde_json::Error> {
        E::deserialize(&self.payload)
    }

    /// Returns a copy with a different type and payload, keeping identity and position.
    #[must_use]
    pub fn with_payload(&self, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            ..self.clone()
        }
    }
}

/// An event published by a command handler and not yet appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCandidate {
    /// The subject to record the event on
    pub subject: Subject,
    /// The event type name
    pub event_type: EventType,
    /// The event payload
    pub payload: serde_json::Value,
    /// Metadata to persist with the event
    pub metadata: Metadata,
}

impl EventCandidate {
    /// Creates a candidate from a typed domain event.
    pub fn from_domain_event<E: DomainEvent>(
        subject: Subject,
        event: &E,
        metadata: Metadata,
    ) -> Result<Self, serde_json::Error> {
        let event_type = EventType::try_new(E::EVENT_TYPE).map_err(|error| {
            <serde_json::Error as serde::ser::Error>::custom(format!(
                "invalid event type '{}': {error}",
                E::EVENT_TYPE
            ))
        })?;
        Ok(Self {
            subject,
            event_type,
            payload: serde_json::to_value(event)?,
            metadata,
        })
    }

    /// Turns the candidate into a stored event.
    pub fn into_event(self, id: EventId, source: impl Into<String>, time: Timestamp) -> Event {
        Event {
            id,
            subject: self.subject,
            event_type: self.event_type,
            source: source.into(),
            payload: self.payload,
            metadata: self.metadata,
            time,
        }
    }
}
