//! State reconstruction for the `SubjectCore` engine.
//!
//! A [`StateRebuilder`] folds a designated initial state over the ordered,
//! upcasted event history of a subject. Fold functions are registered per
//! event type and receive the typed [`DomainEvent`] payload. Reconstruction is
//! purely functional: events are never modified and folding the same sequence
//! always yields the same state.
//!
//! Besides the state, a rebuild records the id of the last event it saw and a
//! watermark per contributing subject. Both are what the state cache uses to
//! decide freshness, and what [`StateRebuilder::catch_up`] uses to fold only
//! the events appended since.
//!
//! # Example
//!
//! ```rust,ignore
//! let rebuilder = StateRebuilder::new(Book::default())
//!     .on(|book: Book, added: BookAdded| book.with_title(added.title))
//!     .on(|book: Book, lent: BookLent| book.lent_to(lent.reader));
//!
//! let rebuilt = rebuilder
//!     .rebuild(&store, &upcasters, &subject, SourcingMode::Local)
//!     .await?;
//! ```

use crate::condition::SourcingMode;
use crate::errors::{CommandResult, RebuildError};
use crate::event::{DomainEvent, Event};
use crate::event_store::{EventStore, ReadOptions};
use crate::types::{EventId, Subject};
use crate::upcasting::{EventUpcaster, UpcasterChain};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

type FoldFn<S> = Arc<dyn Fn(S, &Event) -> Result<S, RebuildError> + Send + Sync>;

/// The result of folding a subject's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuiltState<S> {
    /// The folded state
    pub state: S,
    /// Id of the last event read, `None` if no event was read
    pub last_event_id: Option<EventId>,
    /// Highest event id observed per contributing subject
    pub watermarks: HashMap<Subject, EventId>,
}

impl<S> RebuiltState<S> {
    /// A rebuilt state that has not seen any event.
    pub fn initial(state: S) -> Self {
        Self {
            state,
            last_event_id: None,
            watermarks: HashMap::new(),
        }
    }

    /// Returns `true` if at least one event was recorded exactly on `subject`.
    pub fn subject_exists(&self, subject: &Subject) -> bool {
        self.watermarks.contains_key(subject)
    }
}

/// Folds event histories into states of type `S`.
pub struct StateRebuilder<S> {
    initial: S,
    folds: HashMap<&'static str, FoldFn<S>>,
}

impl<S> Clone for StateRebuilder<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            initial: self.initial.clone(),
            folds: self.folds.clone(),
        }
    }
}

impl<S> std::fmt::Debug for StateRebuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut event_types: Vec<_> = self.folds.keys().collect();
        event_types.sort_unstable();
        f.debug_struct("StateRebuilder")
            .field("state", &std::any::type_name::<S>())
            .field("event_types", &event_types)
            .finish()
    }
}

impl<S> StateRebuilder<S>
where
    S: Clone + Send + Sync + 'static,
{
    /// Creates a rebuilder that starts every rebuild from `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            folds: HashMap::new(),
        }
    }

    /// Registers an infallible fold for events of type `E`.
    #[must_use]
    pub fn on<E, F>(self, fold: F) -> Self
    where
        E: DomainEvent,
        F: Fn(S, E) -> S + Send + Sync + 'static,
    {
        self.try_on(move |state: S, event: E| Ok::<S, String>(fold(state, event)))
    }

    /// Registers a fold for events of type `E` that may reject an event.
    ///
    /// A rejection aborts the rebuild with [`RebuildError::FoldFailed`].
    #[must_use]
    pub fn try_on<E, F, Reason>(mut self, fold: F) -> Self
    where
        E: DomainEvent,
        F: Fn(S, E) -> Result<S, Reason> + Send + Sync + 'static,
        Reason: std::fmt::Display,
    {
        let fold: FoldFn<S> = Arc::new(move |state: S, event: &Event| {
            let payload =
                event
                    .payload_as::<E>()
                    .map_err(|error| RebuildError::PayloadMismatch {
                        event_id: event.id,
                        event_type: E::EVENT_TYPE.to_string(),
                        reason: error.to_string(),
                    })?;
            fold(state, payload).map_err(|error| RebuildError::FoldFailed {
                event_id: event.id,
                reason: error.to_string(),
            })
        });
        self.folds.insert(E::EVENT_TYPE, fold);
        self
    }

    /// Returns `true` if a fold is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.folds.contains_key(event_type)
    }

    /// The state every rebuild starts from.
    pub fn initial_state(&self) -> RebuiltState<S> {
        RebuiltState::initial(self.initial.clone())
    }

    /// Folds raw events onto `start`.
    ///
    /// Raw events must be in strictly increasing id order and belong to the
    /// subject set selected by `subject` and `mode`. Each raw event advances
    /// the watermarks, then its upcasted forms are folded in order. Events
    /// without a registered fold are skipped.
    pub fn fold_events<I>(
        &self,
        start: RebuiltState<S>,
        raw_events: I,
        upcasters: &UpcasterChain,
        subject: &Subject,
        mode: SourcingMode,
    ) -> Result<RebuiltState<S>, RebuildError>
    where
        I: IntoIterator<Item = Event>,
    {
        let selection = ReadOptions::new(mode);
        let mut rebuilt = start;

        for raw in raw_events {
            if let Some(previous) = rebuilt.last_event_id {
                if raw.id <= previous {
                    return Err(RebuildError::InvalidEventOrdering {
                        previous,
                        current: raw.id,
                    });
                }
            }
            if !selection.selects(subject, &raw.subject, raw.id) {
                return Err(RebuildError::UnexpectedSubject {
                    event_id: raw.id,
                    subject: raw.subject,
                    sourced: subject.clone(),
                });
            }

            rebuilt.last_event_id = Some(raw.id);
            rebuilt.watermarks.insert(raw.subject.clone(), raw.id);

            for event in upcasters.upcast(raw) {
                if let Some(fold) = self.folds.get(event.event_type.as_ref()) {
                    rebuilt.state = fold(rebuilt.state, &event)?;
                }
            }
        }

        Ok(rebuilt)
    }

    /// Rebuilds the state of `subject` from its complete history.
    #[instrument(
        name = "rebuild",
        skip(self, store, upcasters),
        fields(state = std::any::type_name::<S>())
    )]
    pub async fn rebuild(
        &self,
        store: &dyn EventStore,
        upcasters: &UpcasterChain,
        subject: &Subject,
        mode: SourcingMode,
    ) -> CommandResult<RebuiltState<S>> {
        let events = store.read_events(subject, &ReadOptions::new(mode)).await?;
        debug!(events = events.len(), "Folding full history");
        Ok(self.fold_events(self.initial_state(), events, upcasters, subject, mode)?)
    }

    /// Brings `previous` up to date by folding only events newer than its
    /// last event id.
    ///
    /// Equivalent to [`rebuild`](Self::rebuild) because folds are deterministic.
    #[instrument(
        name = "catch_up",
        skip(self, store, upcasters, previous),
        fields(state = std::any::type_name::<S>(), after = ?previous.last_event_id)
    )]
    pub async fn catch_up(
        &self,
        store: &dyn EventStore,
        upcasters: &UpcasterChain,
        subject: &Subject,
        mode: SourcingMode,
        previous: RebuiltState<S>,
    ) -> CommandResult<RebuiltState<S>> {
        let options = ReadOptions::new(mode).after_opt(previous.last_event_id);
        let events = store.read_events(subject, &options).await?;
        if events.is_empty() {
            debug!("Previous state is current");
            return Ok(previous);
        }
        debug!(events = events.len(), "Folding newer events");
        Ok(self.fold_events(previous, events, upcasters, subject, mode)?)
    }
}
