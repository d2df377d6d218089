//! Core types for the `SubjectCore` engine.
//!
//! All types use smart constructors to ensure validity at construction time,
//! following the "parse, don't validate" principle. A [`Subject`] that exists
//! is always a well-formed absolute path.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Path separator between subject segments.
pub const SUBJECT_SEPARATOR: char = '/';

fn normalize_subject(raw: String) -> String {
    let trimmed = raw.trim_end_matches(SUBJECT_SEPARATOR);
    if trimmed.is_empty() && raw.starts_with(SUBJECT_SEPARATOR) {
        SUBJECT_SEPARATOR.to_string()
    } else if trimmed.len() == raw.len() {
        raw
    } else {
        trimmed.to_string()
    }
}

fn is_well_formed_subject(path: &str) -> bool {
    path.starts_with(SUBJECT_SEPARATOR) && (path.len() == 1 || !path.contains("//"))
}

/// A hierarchical, slash-delimited address of an aggregate, e.g. `/book/4711/page/3`.
///
/// Subjects form a tree: the ancestors of a subject are its path prefixes and
/// `/` is the root. The identity of an aggregate is exactly its subject.
/// A trailing separator is normalized away, so `/book/4711/` and `/book/4711`
/// are the same subject.
#[nutype(
    sanitize(trim, with = normalize_subject),
    validate(not_empty, len_char_max = 1024, predicate = is_well_formed_subject),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Subject(String);

impl Subject {
    /// The root subject `/`.
    pub fn root() -> Self {
        Self::try_new("/").expect("the root path is always a valid subject")
    }

    /// Returns `true` if this is the root subject.
    pub fn is_root(&self) -> bool {
        self.as_ref().len() == 1
    }

    /// Iterates over the non-empty path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.as_ref()
            .split(SUBJECT_SEPARATOR)
            .filter(|segment| !segment.is_empty())
    }

    /// Number of path segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The direct parent, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let path = self.as_ref();
        let cut = path.rfind(SUBJECT_SEPARATOR).unwrap_or(0);
        let parent = if cut == 0 { "/" } else { &path[..cut] };
        Some(Self::try_new(parent).expect("prefix of a valid subject is a valid subject"))
    }

    /// Appends a single segment.
    pub fn child(&self, segment: &str) -> Result<Self, SubjectError> {
        self.join(segment)
    }

    /// Appends a relative path (`page/3`), ignoring a leading separator.
    pub fn join(&self, relative: &str) -> Result<Self, SubjectError> {
        let relative = relative.trim().trim_start_matches(SUBJECT_SEPARATOR);
        if self.is_root() {
            Self::try_new(format!("/{relative}"))
        } else {
            Self::try_new(format!("{self}/{relative}"))
        }
    }

    /// Returns `true` if `other` lies strictly below this subject.
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other
            .as_ref()
            .strip_prefix(self.as_ref())
            .is_some_and(|rest| rest.starts_with(SUBJECT_SEPARATOR))
    }

    /// Returns `true` if this subject equals `ancestor` or lies below it.
    pub fn is_self_or_descendant_of(&self, ancestor: &Self) -> bool {
        self == ancestor || ancestor.is_ancestor_of(self)
    }
}

/// The position of an event in the store's global total order.
///
/// Identifiers are assigned by the event store and strictly increase with
/// every appended event, so "newer than" is plain integer comparison.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct EventId(u64);

impl EventId {
    /// The identifier assigned to the very first event of a store.
    pub fn first() -> Self {
        Self::new(0)
    }

    /// Returns the identifier following this one.
    #[must_use]
    pub fn next(self) -> Self {
        let current: u64 = self.into();
        Self::new(current + 1)
    }
}

/// The type name of an event, e.g. `com.example.book.added.v1`.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct EventType(String);

/// A timestamp for when an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a new timestamp from a UTC `DateTime`.
    pub const fn new(datetime: DateTime<Utc>) -> Self {
        Self(datetime)
    }

    /// Creates a timestamp representing the current moment.
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Returns the underlying `DateTime`.
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(datetime: DateTime<Utc>) -> Self {
        Self::new(datetime)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
