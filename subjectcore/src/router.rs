//! Command routing.
//!
//! A [`CommandRouter`] looks up the handler registered for a command's type,
//! rebuilds the state the handler decides on, lets the handler publish events
//! and appends them conditioned on the command's [`SubjectCondition`]. Cross
//! cutting concerns (locking, transactions, caching, upcasting) are plain
//! constructor parameters on [`CommandRouterBuilder`].
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = CommandHandlerRegistry::new().register(
//!     book_rebuilder(),
//!     SourcingMode::Local,
//!     |command: AddPage, book: &Book, publisher| {
//!         publisher.publish(&PageAdded { words: command.words })?;
//!         Ok(book.pages + 1)
//!     },
//! );
//! let router = CommandRouter::builder(store, registry).build();
//! let pages = router.send(AddPage { book, words: 300 }, &Metadata::new()).await?;
//! ```

mod publisher;
mod registry;

pub use publisher::CommandEventPublisher;
pub use registry::{Command, CommandHandlerRegistry};

use crate::cache::StateRebuildingCache;
use crate::condition::SubjectCondition;
use crate::config::RouterConfig;
use crate::errors::{CommandError, CommandResult};
use crate::event::Metadata;
use crate::event_store::EventStore;
use crate::lock::DistributedLock;
use crate::metadata::propagate_metadata;
use crate::transaction::TransactionBoundary;
use crate::types::Subject;
use crate::upcasting::UpcasterChain;
use registry::{CommandHandler, StateSource};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Routes commands to their registered handlers.
///
/// Cloning is cheap; clones share the store, cache and registry.
#[derive(Clone)]
pub struct CommandRouter {
    store: Arc<dyn EventStore>,
    registry: Arc<CommandHandlerRegistry>,
    cache: Arc<dyn StateRebuildingCache>,
    upcasters: Arc<UpcasterChain>,
    config: RouterConfig,
    lock: Option<Arc<dyn DistributedLock>>,
    transactions: Option<Arc<dyn TransactionBoundary>>,
}

impl CommandRouter {
    /// Starts building a router over `store` with the handlers in `registry`.
    pub fn builder(
        store: Arc<dyn EventStore>,
        registry: CommandHandlerRegistry,
    ) -> CommandRouterBuilder {
        CommandRouterBuilder {
            store,
            registry,
            config: RouterConfig::default(),
            cache: None,
            upcasters: UpcasterChain::new(),
            lock: None,
            transactions: None,
        }
    }

    /// The router's configuration.
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The state cache used by this router.
    pub fn cache(&self) -> &Arc<dyn StateRebuildingCache> {
        &self.cache
    }

    /// Sends a command and returns what its handler decided.
    ///
    /// # Errors
    /// * `CommandError::NoHandlerFound` - If no handler is registered for `C`
    /// * `CommandError::ValidationFailed` - If the command is invalid
    /// * `CommandError::SubjectConditionViolation` - If the subject condition
    ///   does not hold; nothing is appended
    /// * `CommandError::StateRebuild` - If the handler's state cannot be rebuilt
    /// * `CommandError::TransactionAborted` - If the transaction boundary fails
    ///   before anything was appended
    /// * `CommandError::CommitFailed` - If the commit fails after the events
    ///   were appended; the events stay persisted
    /// * `CommandError::LockUnavailable` - If the subject's lock is not acquired
    /// * Any error the handler returns
    #[instrument(
        skip_all,
        fields(command = std::any::type_name::<C>(), subject = %command.subject())
    )]
    pub async fn send<C: Command>(
        &self,
        command: C,
        metadata: &Metadata,
    ) -> CommandResult<C::Result> {
        let handler = self.registry.get::<C>()?;
        command.validate()?;

        let subject = command.subject();
        let _lease = match &self.lock {
            Some(lock) => Some(lock.acquire(subject.as_ref()).await?),
            None => None,
        };

        let Some(boundary) = &self.transactions else {
            return self
                .decide_and_append(handler.as_ref(), command, &subject, metadata)
                .await
                .map(|(result, _)| result);
        };

        let transaction = boundary.begin().await?;
        match self
            .decide_and_append(handler.as_ref(), command, &subject, metadata)
            .await
        {
            Ok((result, appended)) => match transaction.commit().await {
                Ok(()) => Ok(result),
                Err(error) if appended > 0 => {
                    warn!(%error, appended, "Commit failed after events were appended");
                    Err(CommandError::CommitFailed(error.to_string()))
                }
                Err(error) => Err(error),
            },
            Err(error) => {
                if let Err(rollback) = transaction.rollback().await {
                    warn!(%rollback, %error, "Rolling back command transaction failed");
                }
                Err(error)
            }
        }
    }

    /// Sends the command built by `make_command`, retrying transient failures.
    ///
    /// A fresh command is built for every attempt. Non-transient errors are
    /// returned immediately; transient ones are retried up to
    /// `RetryConfig::max_attempts` times with jittered exponential backoff.
    ///
    /// # Errors
    /// The last error if every attempt failed, see [`CommandRouter::send`].
    pub async fn send_with_retry<C, F>(
        &self,
        mut make_command: F,
        metadata: &Metadata,
    ) -> CommandResult<C::Result>
    where
        C: Command,
        F: FnMut() -> C + Send,
    {
        let retry = self.config.retry;
        let max_attempts = retry.max_attempts.into_inner();
        let mut attempt = 1;
        loop {
            match self.send(make_command(), metadata).await {
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let delay = retry.delay_for(attempt - 1);
                    warn!(
                        attempt,
                        max_attempts,
                        ?delay,
                        %error,
                        "Transient command failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// Runs the handler and appends what it published. Returns the handler's
    /// result and the number of appended events.
    async fn decide_and_append<C: Command>(
        &self,
        handler: &dyn CommandHandler<C>,
        command: C,
        subject: &Subject,
        metadata: &Metadata,
    ) -> CommandResult<(C::Result, usize)> {
        let condition = command.subject_condition();
        let source = StateSource {
            store: self.store.as_ref(),
            cache: self.cache.as_ref(),
            upcasters: &self.upcasters,
        };
        let state = handler.load_state(&source, subject).await?;

        // Events never disappear, so a rebuilt view that saw the subject
        // proves it exists.
        if condition == SubjectCondition::Pristine
            && state.as_ref().is_some_and(|s| s.mentions(subject))
        {
            return Err(violation(subject, condition));
        }

        let mut publisher = CommandEventPublisher::new(subject.clone());
        let result = handler.handle(command, state.as_ref(), &mut publisher)?;

        let mode = self.config.metadata_propagation;
        let candidates: Vec<_> = publisher
            .into_candidates()
            .into_iter()
            .map(|mut candidate| {
                candidate.metadata = propagate_metadata(candidate.metadata, metadata, mode);
                candidate
            })
            .collect();

        if candidates.is_empty() {
            // No append will check the condition, so check it here.
            if condition != SubjectCondition::None {
                let exists = match &state {
                    Some(state) => state.mentions(subject),
                    None => self.store.subject_exists(subject).await?,
                };
                if !condition.matches(exists) {
                    return Err(violation(subject, condition));
                }
            }
            debug!("Handler published no events");
            return Ok((result, 0));
        }

        let appended = self.store.append(subject, condition, candidates).await?;
        let written: BTreeSet<&Subject> = appended.iter().map(|event| &event.subject).collect();
        for subject in written {
            self.cache.invalidate(subject);
        }
        debug!(events = appended.len(), "Appended events");
        Ok((result, appended.len()))
    }
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouter")
            .field("registry", &self.registry)
            .field("upcasters", &self.upcasters)
            .field("config", &self.config)
            .field("locking", &self.lock.is_some())
            .field("transactional", &self.transactions.is_some())
            .finish_non_exhaustive()
    }
}

fn violation(subject: &Subject, condition: SubjectCondition) -> CommandError {
    CommandError::SubjectConditionViolation {
        subject: subject.clone(),
        condition,
    }
}

/// Assembles a [`CommandRouter`].
pub struct CommandRouterBuilder {
    store: Arc<dyn EventStore>,
    registry: CommandHandlerRegistry,
    config: RouterConfig,
    cache: Option<Arc<dyn StateRebuildingCache>>,
    upcasters: UpcasterChain,
    lock: Option<Arc<dyn DistributedLock>>,
    transactions: Option<Arc<dyn TransactionBoundary>>,
}

impl CommandRouterBuilder {
    /// Sets the router configuration.
    #[must_use]
    pub const fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `cache` instead of the one described by `RouterConfig::cache`.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn StateRebuildingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Upcasts every event read for state rebuilding with `upcasters`.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: UpcasterChain) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Holds a lease on the command subject while a command is handled.
    #[must_use]
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Wraps handling and appending of every command in a transaction.
    #[must_use]
    pub fn with_transaction_boundary(mut self, boundary: Arc<dyn TransactionBoundary>) -> Self {
        self.transactions = Some(boundary);
        self
    }

    /// Builds the router.
    pub fn build(self) -> CommandRouter {
        let cache = self.cache.unwrap_or_else(|| self.config.cache.build());
        CommandRouter {
            store: self.store,
            registry: Arc::new(self.registry),
            cache,
            upcasters: Arc::new(self.upcasters),
            config: self.config,
            lock: self.lock,
            transactions: self.transactions,
        }
    }
}

impl std::fmt::Debug for CommandRouterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRouterBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
