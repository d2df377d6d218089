//! In-memory adapters for `SubjectCore`
//!
//! This crate provides in-memory implementations of the capabilities the
//! `subjectcore` engine consumes: an [`InMemoryEventStore`], an
//! [`InMemoryProgressTracker`] and an [`InMemoryDistributedLock`]. They are
//! useful for testing, benchmarks and single-process hosts where persistence
//! is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event_store;
mod lock;
mod progress;

pub use event_store::InMemoryEventStore;
pub use lock::InMemoryDistributedLock;
pub use progress::InMemoryProgressTracker;
