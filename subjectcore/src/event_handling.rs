//! Event handlers and their partitioned processing.
//!
//! An [`EventHandler`] reacts to events after they were appended. Handlers
//! are run by an [`EventHandlingProcessor`], which follows the store's
//! subscription and spreads events over partition workers by sequence id.

mod processor;

pub use processor::{EventHandlingProcessor, EventHandlingProcessorBuilder, ProcessorReport};

use crate::errors::EventHandlingError;
use crate::event::{DomainEvent, Event};
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Reacts to appended events.
///
/// Within one partition, handlers see events in store order and are invoked
/// one at a time. Handling may be repeated after a restart, so handlers must
/// tolerate redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Returns `true` if the handler wants events of `event_type`.
    fn handles(&self, event_type: &str) -> bool;

    /// Handles one event.
    ///
    /// # Errors
    /// * `EventHandlingError::HandlerFailed` - If the event could not be handled
    async fn handle(&self, event: &Event) -> Result<(), EventHandlingError>;
}

/// An [`EventHandler`] for a single typed domain event.
///
/// ```rust,ignore
/// let handler = DomainEventHandler::new("lending-stats", |event: BookLent, _raw| async move {
///     stats.record(event.reader);
///     Ok::<_, String>(())
/// });
/// ```
pub struct DomainEventHandler<E, F> {
    name: String,
    handle: F,
    event: PhantomData<fn() -> E>,
}

impl<E, F> DomainEventHandler<E, F> {
    /// Creates a handler named `name` that runs `handle` on every `E`.
    pub fn new(name: impl Into<String>, handle: F) -> Self {
        Self {
            name: name.into(),
            handle,
            event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F, Fut, Reason> EventHandler for DomainEventHandler<E, F>
where
    E: DomainEvent,
    F: Fn(E, Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), Reason>> + Send,
    Reason: std::fmt::Display,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, event_type: &str) -> bool {
        event_type == E::EVENT_TYPE
    }

    async fn handle(&self, event: &Event) -> Result<(), EventHandlingError> {
        let failed = |reason: String| EventHandlingError::HandlerFailed {
            handler: self.name.clone(),
            event_id: event.id,
            reason,
        };
        let payload = event.payload_as::<E>().map_err(|error| failed(error.to_string()))?;
        (self.handle)(payload, event.clone())
            .await
            .map_err(|reason| failed(reason.to_string()))
    }
}

impl<E, F> std::fmt::Debug for DomainEventHandler<E, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainEventHandler")
            .field("name", &self.name)
            .field("event_type", &std::any::type_name::<E>())
            .finish_non_exhaustive()
    }
}
