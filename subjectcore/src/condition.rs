//! Optimistic-concurrency preconditions and event selection modes.

use serde::{Deserialize, Serialize};

/// Precondition a command places on its subject.
///
/// The condition is evaluated by the event store as part of the atomic
/// append. Evaluating it against an in-memory view is only ever an early
/// rejection, never a substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectCondition {
    /// The subject must not have any events yet.
    Pristine,
    /// The subject must already have at least one event.
    Exists,
    /// No precondition.
    #[default]
    None,
}

impl SubjectCondition {
    /// Checks the condition against whether the subject currently has events.
    pub const fn matches(self, subject_exists: bool) -> bool {
        match self {
            Self::Pristine => !subject_exists,
            Self::Exists => subject_exists,
            Self::None => true,
        }
    }
}

impl std::fmt::Display for SubjectCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pristine => "PRISTINE",
            Self::Exists => "EXISTS",
            Self::None => "NONE",
        };
        f.write_str(name)
    }
}

/// Which events feed a state rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourcingMode {
    /// Only events recorded exactly on the target subject.
    #[default]
    Local,
    /// Events on the target subject and every descendant, in global store order.
    Recursive,
}
