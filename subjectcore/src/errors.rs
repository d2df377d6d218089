//! Error types for `SubjectCore`.
//!
//! Each subsystem has its own error enum. [`CommandError`] is what callers of
//! the command router see; it carries a [`Transience`] classification that
//! tells the caller whether re-sending the command can succeed without
//! changing it.
//!
//! # Error Categories
//!
//! - **CommandError**: command routing failures, surfaced to the caller as-is
//! - **EventStoreError**: storage and append failures
//! - **RebuildError**: programming errors while folding or decoding events
//! - **EventHandlingError**: failures while dispatching events to handlers
//! - **LockError** / **ProgressError**: external capability failures
//!
//! # Example Usage
//!
//! ```rust,ignore
//! match router.send(AddBook { isbn }, Metadata::new()).await {
//!     Ok(book) => show(book),
//!     Err(error) if error.transience() == Transience::Transient => retry_later(),
//!     Err(CommandError::SubjectConditionViolation { .. }) => already_added(),
//!     Err(error) => return Err(error),
//! }
//! ```

use crate::condition::SubjectCondition;
use crate::types::{EventId, Subject};
use thiserror::Error;

/// Whether retrying an operation unchanged can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transience {
    /// Infrastructure trouble; re-running the operation after re-reading state may succeed.
    Transient,
    /// The caller has to change something first; never retried automatically.
    NonTransient,
}

/// Errors that can occur while routing a command.
#[derive(Debug, Clone, Error)]
pub enum CommandError {
    /// No handler is registered for the command type.
    #[error("No command handler registered for {command_type}")]
    NoHandlerFound {
        /// The Rust type name of the command
        command_type: &'static str,
    },

    /// The command failed its own validation.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The subject condition did not hold against the store.
    #[error("Subject condition {condition} violated for subject '{subject}'")]
    SubjectConditionViolation {
        /// The command's subject
        subject: Subject,
        /// The condition that did not hold
        condition: SubjectCondition,
    },

    /// The handler rejected the command.
    #[error("Business rule violation: {0}")]
    BusinessRuleViolation(String),

    /// Rebuilding the handler's state failed.
    #[error("State rebuild failed: {0}")]
    StateRebuild(#[from] RebuildError),

    /// The event store failed while reading or appending.
    #[error("Event store error: {0}")]
    EventStore(EventStoreError),

    /// The surrounding transaction boundary aborted.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// The transaction failed to commit after the command's events were
    /// appended. The events are persisted; re-sending would append them twice.
    #[error("Transaction commit failed after events were appended: {0}")]
    CommitFailed(String),

    /// The command subject's lock could not be acquired.
    #[error("Lock unavailable: {0}")]
    LockUnavailable(#[from] LockError),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Classifies the error for retry decisions.
    pub const fn transience(&self) -> Transience {
        match self {
            Self::EventStore(error) if error.is_transient() => Transience::Transient,
            Self::LockUnavailable(_) | Self::TransactionAborted(_) => Transience::Transient,
            _ => Transience::NonTransient,
        }
    }

    /// Shorthand for `transience() == Transience::Transient`.
    pub const fn is_transient(&self) -> bool {
        matches!(self.transience(), Transience::Transient)
    }
}

impl From<EventStoreError> for CommandError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ConditionViolation { subject, condition } => {
                Self::SubjectConditionViolation { subject, condition }
            }
            other => Self::EventStore(other),
        }
    }
}

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Clone, Error)]
pub enum EventStoreError {
    /// The append was rejected because the subject condition did not hold.
    #[error("Condition {condition} not met for subject '{subject}'")]
    ConditionViolation {
        /// The subject the condition was placed on
        subject: Subject,
        /// The rejected condition
        condition: SubjectCondition,
    },

    /// The store could not be reached.
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A payload or metadata value could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// An unexpected internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EventStoreError {
    /// Infrastructure errors are transient; a violated condition or a
    /// serialization failure will fail again on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Programming errors detected while rebuilding state from events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebuildError {
    /// Events did not arrive in strictly increasing store order.
    #[error("Invalid event ordering: event {current} follows {previous}")]
    InvalidEventOrdering {
        /// The id of the event folded before
        previous: EventId,
        /// The offending id
        current: EventId,
    },

    /// An event outside the requested subject set was returned.
    #[error(
        "Event {event_id} on subject '{subject}' is outside the sourced subjects of '{sourced}'"
    )]
    UnexpectedSubject {
        /// The offending event
        event_id: EventId,
        /// Its subject
        subject: Subject,
        /// The subject that was rebuilt
        sourced: Subject,
    },

    /// A payload did not decode into the fold function's event type.
    #[error("Payload of event {event_id} does not match {event_type}: {reason}")]
    PayloadMismatch {
        /// The offending event
        event_id: EventId,
        /// The expected event type
        event_type: String,
        /// The decoder's message
        reason: String,
    },

    /// A fold function reported a failure.
    #[error("Fold of event {event_id} failed: {reason}")]
    FoldFailed {
        /// The offending event
        event_id: EventId,
        /// The fold function's message
        reason: String,
    },

    /// A cached state had a different type than the rebuilder expected.
    #[error("Cached state is not a {expected}")]
    StateTypeMismatch {
        /// The expected state type name
        expected: &'static str,
    },
}

/// Errors that can occur when parsing raw input into domain types.
///
/// Validation happens at the edges where unstructured data enters the
/// engine: subject paths built from command fields, relative paths handed to
/// the publisher, event type names and configuration values. Once parsed,
/// the resulting types are valid everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A command rejected its own fields.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A subject path was rejected.
    #[error("Invalid subject '{value}': {reason}")]
    InvalidSubject {
        /// The rejected input
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// An event type name was rejected.
    #[error("Invalid event type '{value}': {reason}")]
    InvalidEventType {
        /// The rejected input
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A configuration value was out of range.
    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        /// The configuration field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

impl From<ValidationError> for CommandError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationFailed(err.to_string())
    }
}

/// Failures of a single upcasting transformation.
///
/// These never escape the upcaster chain: a failed transformation falls back
/// to the unchanged event and is logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpcastError {
    /// The payload was expected to be a JSON object.
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// A field the transformation needs is absent.
    #[error("Field '{0}' is missing")]
    MissingField(String),

    /// The transformation rejected its input.
    #[error("{0}")]
    Rejected(String),
}

/// Errors raised while dispatching events to event handlers.
#[derive(Debug, Clone, Error)]
pub enum EventHandlingError {
    /// A handler failed on an event.
    #[error("Handler '{handler}' failed on event {event_id}: {reason}")]
    HandlerFailed {
        /// The handler's name
        handler: String,
        /// The event being handled
        event_id: EventId,
        /// The handler's message
        reason: String,
    },

    /// The event subscription failed.
    #[error("Subscription failed: {0}")]
    Subscription(#[from] EventStoreError),

    /// Progress could not be read or committed.
    #[error("Progress tracking failed: {0}")]
    Progress(#[from] ProgressError),

    /// The partition lock could not be acquired.
    #[error("Partition lock unavailable: {0}")]
    Lock(#[from] LockError),

    /// A worker task terminated unexpectedly.
    #[error("Worker failed: {0}")]
    Worker(String),
}

/// Errors from a [`crate::lock::DistributedLock`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock is held elsewhere and could not be acquired in time.
    #[error("Lock '{key}' not acquired within {waited:?}")]
    Timeout {
        /// The lock key
        key: String,
        /// How long the caller waited
        waited: std::time::Duration,
    },

    /// The lock backend failed.
    #[error("Lock backend failed: {0}")]
    Backend(String),
}

/// Errors from a [`crate::progress::ProgressTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgressError {
    /// The tracker backend failed.
    #[error("Progress backend failed: {0}")]
    Backend(String),
}

/// Type alias for command results.
pub type CommandResult<T> = Result<T, CommandError>;

/// Type alias for event store results.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn subject() -> Subject {
        Subject::try_new("/book/4711").unwrap()
    }

    #[test]
    fn command_error_messages_are_descriptive() {
        let err = CommandError::SubjectConditionViolation {
            subject: subject(),
            condition: SubjectCondition::Pristine,
        };
        insta::assert_snapshot!(
            err.to_string(),
            @"Subject condition PRISTINE violated for subject '/book/4711'"
        );

        let err = CommandError::NoHandlerFound {
            command_type: "AddBook",
        };
        insta::assert_snapshot!(err.to_string(), @"No command handler registered for AddBook");

        let err = CommandError::BusinessRuleViolation("book already lent".to_string());
        assert_eq!(err.to_string(), "Business rule violation: book already lent");
    }

    #[test]
    fn rebuild_error_messages_are_descriptive() {
        let err = RebuildError::InvalidEventOrdering {
            previous: EventId::new(5),
            current: EventId::new(3),
        };
        insta::assert_snapshot!(err.to_string(), @"Invalid event ordering: event 3 follows 5");
    }

    #[test]
    fn validation_errors_become_validation_failures() {
        let err: CommandError = ValidationError::InvalidSubject {
            value: "book//1".to_string(),
            reason: "empty segment".to_string(),
        }
        .into();
        insta::assert_snapshot!(
            err.to_string(),
            @"Validation failed: Invalid subject 'book//1': empty segment"
        );
        assert_eq!(err.transience(), Transience::NonTransient);
    }

    #[test]
    fn condition_violation_converts_to_subject_condition_violation() {
        let store_err = EventStoreError::ConditionViolation {
            subject: subject(),
            condition: SubjectCondition::Exists,
        };
        let command_err: CommandError = store_err.into();

        match command_err {
            CommandError::SubjectConditionViolation { subject: s, condition } => {
                assert_eq!(s, subject());
                assert_eq!(condition, SubjectCondition::Exists);
            }
            other => panic!("Expected SubjectConditionViolation, got {other:?}"),
        }
    }

    #[test]
    fn other_store_errors_are_wrapped() {
        let command_err: CommandError = EventStoreError::Unavailable("down".to_string()).into();
        assert!(matches!(
            command_err,
            CommandError::EventStore(EventStoreError::Unavailable(_))
        ));
    }

    #[test]
    fn infrastructure_failures_are_transient() {
        let unavailable: CommandError = EventStoreError::Unavailable("down".to_string()).into();
        let timeout: CommandError = EventStoreError::Timeout(Duration::from_secs(1)).into();
        let lock = CommandError::LockUnavailable(LockError::Timeout {
            key: "/book/1".to_string(),
            waited: Duration::from_millis(10),
        });

        assert_eq!(unavailable.transience(), Transience::Transient);
        assert_eq!(timeout.transience(), Transience::Transient);
        assert!(lock.is_transient());
    }

    #[test]
    fn commit_failures_after_appending_are_not_retried() {
        let aborted = CommandError::TransactionAborted("deadlock".to_string());
        let lost = CommandError::CommitFailed("connection reset".to_string());

        assert!(aborted.is_transient());
        assert_eq!(lost.transience(), Transience::NonTransient);
        insta::assert_snapshot!(
            lost.to_string(),
            @"Transaction commit failed after events were appended: connection reset"
        );
    }

    #[test]
    fn caller_fixable_failures_are_non_transient() {
        let violation: CommandError = EventStoreError::ConditionViolation {
            subject: subject(),
            condition: SubjectCondition::Pristine,
        }
        .into();
        let errors = [
            violation,
            CommandError::NoHandlerFound {
                command_type: "AddBook",
            },
            CommandError::ValidationFailed("isbn missing".to_string()),
            CommandError::StateRebuild(RebuildError::FoldFailed {
                event_id: EventId::first(),
                reason: "boom".to_string(),
            }),
            CommandError::EventStore(EventStoreError::SerializationFailed("bad".to_string())),
        ];

        for error in errors {
            assert_eq!(error.transience(), Transience::NonTransient, "{error}");
        }
    }
}
