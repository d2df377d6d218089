//! `SubjectCore` - Command handling and state reconstruction over a
//! hierarchical subject space.
//!
//! Commands target a subject such as `/book/4711`, are checked against a
//! [`SubjectCondition`] atomically with the append and turn into events, the
//! only persisted truth. State needed to decide a command is rebuilt from the
//! subject's history by a [`StateRebuilder`], memoized by a
//! [`StateRebuildingCache`] and kept fresh by incremental catch-up. Appended
//! events are handled asynchronously by an [`EventHandlingProcessor`] that
//! partitions them by sequence id.
//!
//! The engine talks to its environment only through capabilities:
//! [`EventStore`], [`DistributedLock`], [`ProgressTracker`] and
//! [`TransactionBoundary`]. `subjectcore-memory` provides in-memory versions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod condition;
pub mod config;
pub mod errors;
pub mod event;
pub mod event_handling;
pub mod event_store;
pub mod lock;
pub mod metadata;
pub mod progress;
pub mod router;
pub mod sequence;
pub mod state_reconstruction;
pub mod transaction;
pub mod types;
pub mod upcasting;

#[cfg(test)]
mod test_support;

pub use cache::{
    CacheKey, CacheValue, LruStateRebuildingCache, NoStateRebuildingCache, StateRebuildingCache,
};
pub use condition::{SourcingMode, SubjectCondition};
pub use config::{CacheConfig, EventHandlingConfig, RetryConfig, RouterConfig};
pub use errors::{
    CommandError, CommandResult, EventHandlingError, EventStoreError, EventStoreResult, LockError,
    ProgressError, RebuildError, Transience, UpcastError, ValidationError,
};
pub use event::{DomainEvent, Event, EventCandidate, Metadata};
pub use event_handling::{DomainEventHandler, EventHandler, EventHandlingProcessor, ProcessorReport};
pub use event_store::{EventStore, EventStream, ReadOptions};
pub use lock::{DistributedLock, LockLease};
pub use metadata::{propagate_metadata, MetaDataPropagationMode};
pub use progress::{PartitionKey, ProgressTracker};
pub use router::{
    Command, CommandEventPublisher, CommandHandlerRegistry, CommandRouter, CommandRouterBuilder,
};
pub use sequence::{
    EventSequenceResolver, PerLevelSubjectSequenceResolver, PerSubjectSequenceResolver,
};
pub use state_reconstruction::{RebuiltState, StateRebuilder};
pub use transaction::{Transaction, TransactionBoundary};
pub use types::{EventId, EventType, Subject, Timestamp};
pub use upcasting::{EventUpcaster, UpcasterChain};
