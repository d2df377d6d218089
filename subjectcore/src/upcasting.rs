//! Upcasting of stored events into their current shape.
//!
//! Stored events are never rewritten. Instead, every event read from the
//! store passes through an [`UpcasterChain`] that turns legacy shapes into
//! the events the current fold functions and handlers understand. A stage
//! may rename a type, migrate a payload, rewrite metadata or split one event
//! into several.
//!
//! Upcasting is total: a stage that does not apply returns its input, and a
//! stage whose transformation fails logs a warning and returns its input
//! unchanged as well.

use crate::errors::UpcastError;
use crate::event::{Event, Metadata};
use crate::types::EventType;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// A reusable payload transformation.
pub type PayloadMigration = Arc<dyn Fn(Value) -> Result<Value, UpcastError> + Send + Sync>;

/// A reusable metadata transformation.
pub type MetadataMigration = Arc<dyn Fn(Metadata) -> Result<Metadata, UpcastError> + Send + Sync>;

/// Splits one legacy event into `(event type, payload)` parts.
pub type EventSplitter =
    Arc<dyn Fn(&Event) -> Result<Vec<(EventType, Value)>, UpcastError> + Send + Sync>;

/// Transforms one stored event into zero, one or many current events.
pub trait EventUpcaster: Send + Sync {
    /// Upcasts a single event. Must be pure and deterministic.
    fn upcast(&self, event: Event) -> Vec<Event>;
}

fn unchanged_on_failure(
    upcaster: &'static str,
    event: Event,
    result: Result<Vec<Event>, UpcastError>,
) -> Vec<Event> {
    match result {
        Ok(events) => events,
        Err(error) => {
            warn!(
                upcaster,
                event_id = %event.id,
                event_type = %event.event_type,
                %error,
                "Upcast failed, keeping event unchanged"
            );
            vec![event]
        }
    }
}

/// Renames an event type, optionally migrating its payload on the way.
pub struct EventTypeUpcaster {
    from: EventType,
    to: EventType,
    migration: Option<PayloadMigration>,
}

impl EventTypeUpcaster {
    /// Renames events of type `from` to `to`.
    pub const fn new(from: EventType, to: EventType) -> Self {
        Self {
            from,
            to,
            migration: None,
        }
    }

    /// Also migrates the payload of renamed events.
    #[must_use]
    pub fn with_migration(mut self, migration: PayloadMigration) -> Self {
        self.migration = Some(migration);
        self
    }
}

impl EventUpcaster for EventTypeUpcaster {
    fn upcast(&self, event: Event) -> Vec<Event> {
        if event.event_type != self.from {
            return vec![event];
        }
        let payload = match &self.migration {
            Some(migration) => migration(event.payload.clone()),
            None => Ok(event.payload.clone()),
        };
        let result = payload.map(|payload| vec![event.with_payload(self.to.clone(), payload)]);
        unchanged_on_failure("EventTypeUpcaster", event, result)
    }
}

/// Migrates the payload of events of one type, keeping the type.
pub struct PayloadUpcaster {
    event_type: EventType,
    migration: PayloadMigration,
}

impl PayloadUpcaster {
    /// Applies `migration` to every event of `event_type`.
    pub const fn new(event_type: EventType, migration: PayloadMigration) -> Self {
        Self {
            event_type,
            migration,
        }
    }
}

impl EventUpcaster for PayloadUpcaster {
    fn upcast(&self, event: Event) -> Vec<Event> {
        if event.event_type != self.event_type {
            return vec![event];
        }
        let result = (self.migration)(event.payload.clone())
            .map(|payload| vec![event.with_payload(event.event_type.clone(), payload)]);
        unchanged_on_failure("PayloadUpcaster", event, result)
    }
}

/// Rewrites the metadata of events of one type.
pub struct MetadataUpcaster {
    event_type: EventType,
    migration: MetadataMigration,
}

impl MetadataUpcaster {
    /// Applies `migration` to the metadata of every event of `event_type`.
    pub const fn new(event_type: EventType, migration: MetadataMigration) -> Self {
        Self {
            event_type,
            migration,
        }
    }
}

impl EventUpcaster for MetadataUpcaster {
    fn upcast(&self, event: Event) -> Vec<Event> {
        if event.event_type != self.event_type {
            return vec![event];
        }
        let result = (self.migration)(event.metadata.clone()).map(|metadata| {
            vec![Event {
                metadata,
                ..event.clone()
            }]
        });
        unchanged_on_failure("MetadataUpcaster", event, result)
    }
}

/// Splits one legacy event into several current events.
///
/// All parts keep the identity, subject and position of the legacy event.
pub struct SplittingUpcaster {
    event_type: EventType,
    splitter: EventSplitter,
}

impl SplittingUpcaster {
    /// Splits every event of `event_type` with `splitter`.
    pub const fn new(event_type: EventType, splitter: EventSplitter) -> Self {
        Self {
            event_type,
            splitter,
        }
    }
}

impl EventUpcaster for SplittingUpcaster {
    fn upcast(&self, event: Event) -> Vec<Event> {
        if event.event_type != self.event_type {
            return vec![event];
        }
        let result = (self.splitter)(&event).map(|parts| {
            parts
                .into_iter()
                .map(|(event_type, payload)| event.with_payload(event_type, payload))
                .collect()
        });
        unchanged_on_failure("SplittingUpcaster", event, result)
    }
}

/// An ordered composition of upcasters.
///
/// Each stage consumes the complete output of the previous stage, so a
/// stage may act on events produced by an earlier split.
#[derive(Clone, Default)]
pub struct UpcasterChain {
    stages: Vec<Arc<dyn EventUpcaster>>,
}

impl UpcasterChain {
    /// Creates an empty chain that passes events through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn with(mut self, upcaster: impl EventUpcaster + 'static) -> Self {
        self.stages.push(Arc::new(upcaster));
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` if the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Upcasts a sequence of raw events, preserving their order.
    pub fn upcast_all(&self, events: Vec<Event>) -> Vec<Event> {
        self.stages.iter().fold(events, |events, stage| {
            events
                .into_iter()
                .flat_map(|event| stage.upcast(event))
                .collect()
        })
    }
}

impl EventUpcaster for UpcasterChain {
    fn upcast(&self, event: Event) -> Vec<Event> {
        self.upcast_all(vec![event])
    }
}

impl std::fmt::Debug for UpcasterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcasterChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

/// Common payload migrations.
pub mod migrations {
    use super::PayloadMigration;
    use crate::errors::UpcastError;
    use serde_json::Value;
    use std::sync::Arc;

    /// Adds a field with a default value unless it is already present.
    pub fn add_field(field_name: &str, default_value: Value) -> PayloadMigration {
        let field_name = field_name.to_string();
        Arc::new(move |mut value: Value| {
            let map = value.as_object_mut().ok_or(UpcastError::NotAnObject)?;
            map.entry(field_name.clone())
                .or_insert_with(|| default_value.clone());
            Ok(value)
        })
    }

    /// Removes a field if present.
    pub fn remove_field(field_name: &str) -> PayloadMigration {
        let field_name = field_name.to_string();
        Arc::new(move |mut value: Value| {
            let map = value.as_object_mut().ok_or(UpcastError::NotAnObject)?;
            map.remove(&field_name);
            Ok(value)
        })
    }

    /// Renames a field; a payload without the field is left alone.
    pub fn rename_field(old_name: &str, new_name: &str) -> PayloadMigration {
        let old_name = old_name.to_string();
        let new_name = new_name.to_string();
        Arc::new(move |mut value: Value| {
            let map = value.as_object_mut().ok_or(UpcastError::NotAnObject)?;
            if let Some(field) = map.remove(&old_name) {
                map.insert(new_name.clone(), field);
            }
            Ok(value)
        })
    }

    /// Transforms the value of a field that must be present.
    pub fn transform_field<F>(field_name: &str, transform: F) -> PayloadMigration
    where
        F: Fn(Value) -> Result<Value, UpcastError> + Send + Sync + 'static,
    {
        let field_name = field_name.to_string();
        Arc::new(move |mut value: Value| {
            let map = value.as_object_mut().ok_or(UpcastError::NotAnObject)?;
            let field = map
                .remove(&field_name)
                .ok_or_else(|| UpcastError::MissingField(field_name.clone()))?;
            map.insert(field_name.clone(), transform(field)?);
            Ok(value)
        })
    }

    /// Runs migrations one after another.
    pub fn compose(migrations: Vec<PayloadMigration>) -> PayloadMigration {
        Arc::new(move |value: Value| {
            migrations
                .iter()
                .try_fold(value, |value, migration| migration(value))
        })
    }
}
