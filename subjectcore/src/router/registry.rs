//! The explicit command handler registry.
//!
//! Handlers are registered once at start-up, together with the state they
//! need and the sourcing mode to rebuild it with. The registry is keyed by
//! the concrete command type, so routing is a single map lookup.

use super::publisher::CommandEventPublisher;
use crate::cache::{rebuild_fn, CacheKey, CacheValue, StateRebuildingCache};
use crate::condition::{SourcingMode, SubjectCondition};
use crate::errors::{CommandError, CommandResult, ValidationError};
use crate::event_store::EventStore;
use crate::state_reconstruction::StateRebuilder;
use crate::types::Subject;
use crate::upcasting::UpcasterChain;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// An intent to change the state of one subject.
///
/// Commands are never persisted; only the events their handler publishes are.
pub trait Command: Send + Sync + 'static {
    /// What the handler returns on success.
    type Result: Send + 'static;

    /// The subject the command targets.
    fn subject(&self) -> Subject;

    /// The precondition checked atomically with the append.
    fn subject_condition(&self) -> SubjectCondition {
        SubjectCondition::None
    }

    /// Validates the command's own fields before any state is read.
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// What a registered handler needs from the router to load its state.
pub(crate) struct StateSource<'a> {
    pub(crate) store: &'a dyn EventStore,
    pub(crate) cache: &'a dyn StateRebuildingCache,
    pub(crate) upcasters: &'a UpcasterChain,
}

#[async_trait]
pub(crate) trait CommandHandler<C: Command>: Send + Sync {
    /// Loads the handler's state for `subject`, `None` for stateless handlers.
    async fn load_state(
        &self,
        source: &StateSource<'_>,
        subject: &Subject,
    ) -> CommandResult<Option<CacheValue>>;

    /// Decides on the command.
    fn handle(
        &self,
        command: C,
        state: Option<&CacheValue>,
        publisher: &mut CommandEventPublisher,
    ) -> CommandResult<C::Result>;
}

type HandleFn<C, S> = Arc<
    dyn Fn(C, &S, &mut CommandEventPublisher) -> CommandResult<<C as Command>::Result>
        + Send
        + Sync,
>;

struct StatefulHandler<C: Command, S> {
    rebuilder: StateRebuilder<S>,
    mode: SourcingMode,
    handle: HandleFn<C, S>,
}

#[async_trait]
impl<C, S> CommandHandler<C> for StatefulHandler<C, S>
where
    C: Command,
    S: Clone + Send + Sync + 'static,
{
    async fn load_state(
        &self,
        source: &StateSource<'_>,
        subject: &Subject,
    ) -> CommandResult<Option<CacheValue>> {
        let key = CacheKey::of::<S>(subject.clone(), self.mode);
        let rebuilder = &self.rebuilder;
        let mode = self.mode;
        let (store, upcasters) = (source.store, source.upcasters);
        let rebuild = rebuild_fn(move |previous: Option<CacheValue>| async move {
            let rebuilt = match previous {
                Some(previous) => {
                    let previous = previous.to_rebuilt::<S>()?;
                    rebuilder
                        .catch_up(store, upcasters, subject, mode, previous)
                        .await?
                }
                None => rebuilder.rebuild(store, upcasters, subject, mode).await?,
            };
            Ok::<_, CommandError>(CacheValue::from_rebuilt(rebuilt))
        });
        source.cache.fetch_and_merge(&key, rebuild).await.map(Some)
    }

    fn handle(
        &self,
        command: C,
        state: Option<&CacheValue>,
        publisher: &mut CommandEventPublisher,
    ) -> CommandResult<C::Result> {
        let state = state.and_then(CacheValue::state::<S>).ok_or_else(|| {
            CommandError::Internal(format!(
                "no {} state loaded for {}",
                std::any::type_name::<S>(),
                std::any::type_name::<C>()
            ))
        })?;
        (self.handle)(command, state, publisher)
    }
}

type StatelessHandleFn<C> = Arc<
    dyn Fn(C, &mut CommandEventPublisher) -> CommandResult<<C as Command>::Result> + Send + Sync,
>;

struct StatelessHandler<C: Command> {
    handle: StatelessHandleFn<C>,
}

#[async_trait]
impl<C: Command> CommandHandler<C> for StatelessHandler<C> {
    async fn load_state(
        &self,
        _source: &StateSource<'_>,
        _subject: &Subject,
    ) -> CommandResult<Option<CacheValue>> {
        Ok(None)
    }

    fn handle(
        &self,
        command: C,
        _state: Option<&CacheValue>,
        publisher: &mut CommandEventPublisher,
    ) -> CommandResult<C::Result> {
        (self.handle)(command, publisher)
    }
}

/// Maps command types to their handlers.
#[derive(Default)]
pub struct CommandHandlerRegistry {
    handlers: HashMap<TypeId, (&'static str, Box<dyn Any + Send + Sync>)>,
}

impl CommandHandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `C` that decides on state of type `S`, rebuilt
    /// by `rebuilder` in `mode`.
    ///
    /// Cached state is keyed by subject, `S` and `mode`, not by rebuilder:
    /// handlers for the same `S` and mode reuse each other's cached state, so
    /// pass them equivalent rebuilders (typically one shared constructor).
    ///
    /// Registering a second handler for the same command type replaces the
    /// first.
    #[must_use]
    pub fn register<C, S, F>(
        self,
        rebuilder: StateRebuilder<S>,
        mode: SourcingMode,
        handle: F,
    ) -> Self
    where
        C: Command,
        S: Clone + Send + Sync + 'static,
        F: Fn(C, &S, &mut CommandEventPublisher) -> CommandResult<C::Result>
            + Send
            + Sync
            + 'static,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::new(StatefulHandler {
            rebuilder,
            mode,
            handle: Arc::new(handle),
        });
        self.insert(handler)
    }

    /// Registers a handler for `C` that needs no state; nothing is read.
    #[must_use]
    pub fn register_stateless<C, F>(self, handle: F) -> Self
    where
        C: Command,
        F: Fn(C, &mut CommandEventPublisher) -> CommandResult<C::Result>
            + Send
            + Sync
            + 'static,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::new(StatelessHandler {
            handle: Arc::new(handle),
        });
        self.insert(handler)
    }

    /// Returns `true` if a handler for `C` is registered.
    pub fn contains<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub(crate) fn get<C: Command>(&self) -> CommandResult<Arc<dyn CommandHandler<C>>> {
        self.handlers
            .get(&TypeId::of::<C>())
            .and_then(|(_, handler)| handler.downcast_ref::<Arc<dyn CommandHandler<C>>>())
            .cloned()
            .ok_or(CommandError::NoHandlerFound {
                command_type: std::any::type_name::<C>(),
            })
    }

    fn insert<C: Command>(mut self, handler: Arc<dyn CommandHandler<C>>) -> Self {
        let command_type = std::any::type_name::<C>();
        if self
            .handlers
            .insert(TypeId::of::<C>(), (command_type, Box::new(handler)))
            .is_some()
        {
            warn!(command_type, "Replacing previously registered command handler");
        }
        self
    }
}

impl std::fmt::Debug for CommandHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut commands: Vec<_> = self.handlers.values().map(|(name, _)| *name).collect();
        commands.sort_unstable();
        f.debug_struct("CommandHandlerRegistry")
            .field("commands", &commands)
            .finish()
    }
}
