//! The capability through which a command handler publishes events.

use crate::errors::{CommandError, CommandResult, ValidationError};
use crate::event::{DomainEvent, EventCandidate, Metadata};
use crate::types::Subject;

/// Records the events a command handler decides to publish.
///
/// Nothing is written until the handler returns successfully; the router then
/// appends every recorded event in one conditional append.
#[derive(Debug)]
pub struct CommandEventPublisher {
    subject: Subject,
    recorded: Vec<EventCandidate>,
}

impl CommandEventPublisher {
    pub(crate) const fn new(subject: Subject) -> Self {
        Self {
            subject,
            recorded: Vec::new(),
        }
    }

    /// The command's subject.
    pub const fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Publishes `event` on the command's subject.
    pub fn publish<E: DomainEvent>(&mut self, event: &E) -> CommandResult<()> {
        self.publish_with_metadata(event, Metadata::new())
    }

    /// Publishes `event` on the command's subject with extra metadata.
    pub fn publish_with_metadata<E: DomainEvent>(
        &mut self,
        event: &E,
        metadata: Metadata,
    ) -> CommandResult<()> {
        self.record(self.subject.clone(), event, metadata)
    }

    /// Publishes `event` on a subject below the command's subject, e.g.
    /// `page/3` below `/book/4711`.
    pub fn publish_relative<E: DomainEvent>(
        &mut self,
        relative: &str,
        event: &E,
    ) -> CommandResult<()> {
        self.publish_relative_with_metadata(relative, event, Metadata::new())
    }

    /// Publishes `event` on a subject below the command's subject with extra
    /// metadata.
    pub fn publish_relative_with_metadata<E: DomainEvent>(
        &mut self,
        relative: &str,
        event: &E,
        metadata: Metadata,
    ) -> CommandResult<()> {
        let subject = self
            .subject
            .join(relative)
            .map_err(|error| ValidationError::InvalidSubject {
                value: relative.to_string(),
                reason: error.to_string(),
            })?;
        self.record(subject, event, metadata)
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    /// Returns `true` if nothing was published.
    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    pub(crate) fn into_candidates(self) -> Vec<EventCandidate> {
        self.recorded
    }

    fn record<E: DomainEvent>(
        &mut self,
        subject: Subject,
        event: &E,
        metadata: Metadata,
    ) -> CommandResult<()> {
        let candidate =
            EventCandidate::from_domain_event(subject, event, metadata).map_err(|error| {
                CommandError::Internal(format!("cannot serialize {}: {error}", E::EVENT_TYPE))
            })?;
        self.recorded.push(candidate);
        Ok(())
    }
}
