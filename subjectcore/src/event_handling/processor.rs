//! The partitioned event handling processor.

use super::EventHandler;
use crate::config::EventHandlingConfig;
use crate::errors::EventHandlingError;
use crate::event::Event;
use crate::event_store::EventStore;
use crate::lock::{DistributedLock, LockLease};
use crate::progress::{PartitionKey, ProgressTracker};
use crate::sequence::{partition_for, EventSequenceResolver, PerLevelSubjectSequenceResolver};
use crate::types::EventId;
use crate::upcasting::UpcasterChain;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// One raw event and what upcasting made of it.
struct Dispatch {
    raw_id: EventId,
    events: Vec<Event>,
}

/// What happened on each partition during one run.
#[derive(Debug, Default)]
pub struct ProcessorReport {
    handled: BTreeMap<u32, usize>,
    failed: BTreeMap<u32, EventHandlingError>,
}

impl ProcessorReport {
    /// Raw events handled and committed on `partition`.
    pub fn handled(&self, partition: u32) -> usize {
        self.handled.get(&partition).copied().unwrap_or_default()
    }

    /// Raw events handled and committed across all partitions.
    pub fn total_handled(&self) -> usize {
        self.handled.values().sum()
    }

    /// The error that stopped `partition`, if any.
    pub fn failure(&self, partition: u32) -> Option<&EventHandlingError> {
        self.failed.get(&partition)
    }

    /// Partitions that stopped on a handler failure.
    pub fn failed_partitions(&self) -> impl Iterator<Item = u32> + '_ {
        self.failed.keys().copied()
    }

    /// Returns `true` if no partition failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct PartitionOutcome {
    partition: u32,
    handled: usize,
    failure: Option<EventHandlingError>,
}

/// Feeds the store's subscription to [`EventHandler`]s, partition by
/// partition.
///
/// Events are mapped to partitions through their sequence id. Each partition
/// has its own worker handling events strictly in store order and committing
/// progress after every raw event, while different partitions run in parallel.
pub struct EventHandlingProcessor {
    store: Arc<dyn EventStore>,
    progress: Arc<dyn ProgressTracker>,
    config: EventHandlingConfig,
    resolver: Arc<dyn EventSequenceResolver>,
    upcasters: Arc<UpcasterChain>,
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
    lock: Option<Arc<dyn DistributedLock>>,
}

impl EventHandlingProcessor {
    /// Starts building a processor reading from `store` and checkpointing to
    /// `progress`.
    pub fn builder(
        store: Arc<dyn EventStore>,
        progress: Arc<dyn ProgressTracker>,
    ) -> EventHandlingProcessorBuilder {
        EventHandlingProcessorBuilder {
            store,
            progress,
            config: EventHandlingConfig::default(),
            resolver: Arc::new(PerLevelSubjectSequenceResolver::default()),
            upcasters: UpcasterChain::new(),
            handlers: Vec::new(),
            lock: None,
        }
    }

    /// The processor's configuration.
    pub const fn config(&self) -> &EventHandlingConfig {
        &self.config
    }

    /// Handles events until the subscription ends or `shutdown` resolves.
    ///
    /// Workers are drained before returning, so every event dispatched before
    /// shutdown is handled or reported as failed.
    ///
    /// # Errors
    /// * `EventHandlingError::Subscription` - If the subscription fails
    /// * `EventHandlingError::Progress` - If progress cannot be read
    /// * `EventHandlingError::Lock` - If a partition lock is not acquired
    /// * `EventHandlingError::Worker` - If a worker task panicked
    #[instrument(skip_all, fields(group = %self.config.group))]
    pub async fn run<F>(&self, shutdown: F) -> Result<ProcessorReport, EventHandlingError>
    where
        F: Future<Output = ()> + Send,
    {
        let partitions = self.config.partitions;
        let mut workers = Vec::new();
        for partition in 0..partitions.into_inner() {
            let key = PartitionKey::new(self.config.group.clone(), partition);
            let lease = match &self.lock {
                Some(lock) => Some(lock.acquire(&key.to_string()).await?),
                None => None,
            };
            let committed = self.progress.last_committed(&key).await?;
            workers.push(PartitionWorker {
                key,
                committed,
                handlers: Arc::clone(&self.handlers),
                progress: Arc::clone(&self.progress),
                _lease: lease,
            });
        }

        let after = resume_point(workers.iter().map(|worker| worker.committed));
        let mut subscription = self.store.subscribe(after).await?;
        info!(partitions = partitions.into_inner(), ?after, "Event handling started");

        let queue_depth = self.config.queue_depth.into_inner();
        let mut senders = BTreeMap::new();
        let mut handles: Vec<JoinHandle<PartitionOutcome>> = Vec::new();
        for worker in workers {
            let (sender, receiver) = mpsc::channel(queue_depth);
            senders.insert(worker.key.partition(), sender);
            handles.push(tokio::spawn(worker.run(receiver).in_current_span()));
        }

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                next = subscription.next() => match next {
                    None => {
                        debug!("Subscription ended");
                        break Ok(());
                    }
                    Some(Err(error)) => {
                        error!(%error, "Subscription failed");
                        break Err(EventHandlingError::Subscription(error));
                    }
                    Some(Ok(raw)) => {
                        let partition = partition_for(&self.resolver.sequence_id(&raw), partitions);
                        let dispatch = Dispatch {
                            raw_id: raw.id,
                            events: self.upcasters.upcast_all(vec![raw]),
                        };
                        let Some(sender) = senders.get(&partition) else {
                            break Err(EventHandlingError::Worker(format!(
                                "no worker for partition {partition}"
                            )));
                        };
                        if sender.send(dispatch).await.is_err() {
                            break Err(EventHandlingError::Worker(format!(
                                "worker {partition} stopped"
                            )));
                        }
                    }
                }
            }
        };

        drop(senders);
        let mut report = ProcessorReport::default();
        for handle in handles {
            let finished = handle
                .await
                .map_err(|error| EventHandlingError::Worker(error.to_string()))?;
            report.handled.insert(finished.partition, finished.handled);
            if let Some(failure) = finished.failure {
                report.failed.insert(finished.partition, failure);
            }
        }
        info!(
            handled = report.total_handled(),
            failed = report.failed.len(),
            "Event handling stopped"
        );
        outcome.map(|()| report)
    }
}

impl std::fmt::Debug for EventHandlingProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers: Vec<_> = self.handlers.iter().map(|handler| handler.name()).collect();
        f.debug_struct("EventHandlingProcessor")
            .field("config", &self.config)
            .field("handlers", &handlers)
            .field("locking", &self.lock.is_some())
            .finish_non_exhaustive()
    }
}

/// The subscription start shared by all partitions: the smallest committed
/// id, or the beginning if any partition never committed.
fn resume_point(committed: impl Iterator<Item = Option<EventId>>) -> Option<EventId> {
    committed
        .collect::<Option<Vec<_>>>()
        .and_then(|ids| ids.into_iter().min())
}

struct PartitionWorker {
    key: PartitionKey,
    committed: Option<EventId>,
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
    progress: Arc<dyn ProgressTracker>,
    _lease: Option<LockLease>,
}

impl PartitionWorker {
    async fn run(mut self, mut receiver: mpsc::Receiver<Dispatch>) -> PartitionOutcome {
        let mut handled = 0;
        let mut failure = None;
        while let Some(dispatch) = receiver.recv().await {
            if failure.is_some() {
                continue;
            }
            if self.committed.is_some_and(|committed| dispatch.raw_id <= committed) {
                debug!(
                    partition = %self.key,
                    event_id = %dispatch.raw_id,
                    "Skipping handled event"
                );
                continue;
            }
            match self.process(&dispatch).await {
                Ok(()) => {
                    handled += 1;
                    self.committed = Some(dispatch.raw_id);
                }
                Err(error) => {
                    error!(
                        partition = %self.key,
                        event_id = %dispatch.raw_id,
                        %error,
                        "Event handling failed, partition stopped"
                    );
                    failure = Some(error);
                }
            }
        }
        if failure.is_some() {
            warn!(partition = %self.key, "Partition drained without handling");
        }
        PartitionOutcome {
            partition: self.key.partition(),
            handled,
            failure,
        }
    }

    async fn process(&self, dispatch: &Dispatch) -> Result<(), EventHandlingError> {
        for event in &dispatch.events {
            for handler in self
                .handlers
                .iter()
                .filter(|handler| handler.handles(event.event_type.as_ref()))
            {
                handler.handle(event).await?;
            }
        }
        self.progress.commit(&self.key, dispatch.raw_id).await?;
        Ok(())
    }
}

/// Assembles an [`EventHandlingProcessor`].
pub struct EventHandlingProcessorBuilder {
    store: Arc<dyn EventStore>,
    progress: Arc<dyn ProgressTracker>,
    config: EventHandlingConfig,
    resolver: Arc<dyn EventSequenceResolver>,
    upcasters: UpcasterChain,
    handlers: Vec<Arc<dyn EventHandler>>,
    lock: Option<Arc<dyn DistributedLock>>,
}

impl EventHandlingProcessorBuilder {
    /// Sets the processing group and partitioning.
    #[must_use]
    pub fn with_config(mut self, config: EventHandlingConfig) -> Self {
        self.config = config;
        self
    }

    /// Maps events to sequences with `resolver`. Defaults to two subject levels.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn EventSequenceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Upcasts every event before it reaches the handlers.
    #[must_use]
    pub fn with_upcasters(mut self, upcasters: UpcasterChain) -> Self {
        self.upcasters = upcasters;
        self
    }

    /// Adds a handler. Handlers run in the order they were added.
    #[must_use]
    pub fn with_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Holds a lease on every partition for the duration of a run.
    #[must_use]
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Builds the processor.
    pub fn build(self) -> EventHandlingProcessor {
        EventHandlingProcessor {
            store: self.store,
            progress: self.progress,
            config: self.config,
            resolver: self.resolver,
            upcasters: Arc::new(self.upcasters),
            handlers: Arc::new(self.handlers),
            lock: self.lock,
        }
    }
}

impl std::fmt::Debug for EventHandlingProcessorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlingProcessorBuilder")
            .field("config", &self.config)
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::SubjectCondition;
    use crate::config::{LevelsToKeep, PartitionCount};
    use crate::event::DomainEvent;
    use crate::event_handling::DomainEventHandler;
    use crate::sequence::PerSubjectSequenceResolver;
    use crate::test_support::{candidate, MapProgressTracker, VecEventStore};
    use crate::types::{EventType, Subject};
    use crate::upcasting::EventTypeUpcaster;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tracing_test::traced_test;

    #[derive(Debug, Serialize, Deserialize)]
    struct PageAdded {
        words: u64,
    }

    impl DomainEvent for PageAdded {
        const EVENT_TYPE: &'static str = "page.added.v1";
    }

    type Seen = Arc<Mutex<Vec<(String, EventId)>>>;

    /// Records every page; pages without words fail.
    fn recording_handler(seen: &Seen) -> impl EventHandler {
        let seen = Arc::clone(seen);
        DomainEventHandler::new("pages", move |page: PageAdded, event: Event| {
            let seen = Arc::clone(&seen);
            async move {
                if page.words == 0 {
                    return Err(format!("empty page on {}", event.subject));
                }
                seen.lock().push((event.subject.to_string(), event.id));
                Ok(())
            }
        })
    }

    fn subject(path: &str) -> Subject {
        Subject::try_new(path).unwrap()
    }

    async fn add_page(store: &VecEventStore, path: &str, words: u64) -> EventId {
        let subject = subject(path);
        store
            .append(
                &subject,
                SubjectCondition::None,
                vec![candidate::<PageAdded>(&subject, json!({ "words": words }))],
            )
            .await
            .unwrap()[0]
            .id
    }

    fn processor(
        store: &Arc<VecEventStore>,
        progress: &Arc<MapProgressTracker>,
        seen: &Seen,
    ) -> EventHandlingProcessor {
        EventHandlingProcessor::builder(store.clone(), progress.clone())
            .with_resolver(Arc::new(PerSubjectSequenceResolver))
            .with_handler(recording_handler(seen))
            .build()
    }

    async fn run_to_end(
        store: &Arc<VecEventStore>,
        progress: &Arc<MapProgressTracker>,
        seen: &Seen,
    ) -> ProcessorReport {
        processor(store, progress, seen)
            .run(futures::future::pending())
            .await
            .unwrap()
    }

    fn partition_of(path: &str) -> u32 {
        partition_for(path, PartitionCount::default())
    }

    #[test]
    fn resume_point_is_the_smallest_commit_unless_a_partition_is_new() {
        let ids = |values: &[Option<u64>]| {
            values
                .iter()
                .map(|v| v.map(EventId::new))
                .collect::<Vec<_>>()
        };

        assert_eq!(
            resume_point(ids(&[Some(4), Some(2), Some(9)]).into_iter()),
            Some(EventId::new(2))
        );
        assert_eq!(resume_point(ids(&[Some(4), None]).into_iter()), None);
        assert_eq!(resume_point(ids(&[]).into_iter()), None);
    }

    #[tokio::test]
    async fn events_are_handled_in_order_per_sequence() {
        let store = Arc::new(VecEventStore::default());
        let progress = Arc::new(MapProgressTracker::default());
        let seen = Seen::default();
        for round in 1..=5 {
            for book in ["/book/1", "/book/2", "/book/3"] {
                add_page(&store, book, round).await;
            }
        }

        let report = run_to_end(&store, &progress, &seen).await;

        assert!(report.is_clean());
        assert_eq!(report.total_handled(), 15);
        let seen = seen.lock();
        for book in ["/book/1", "/book/2", "/book/3"] {
            let ids: Vec<_> = seen.iter().filter(|(s, _)| s == book).map(|(_, id)| *id).collect();
            assert_eq!(ids.len(), 5);
            assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_partition_does_not_block_the_others() {
        let store = Arc::new(VecEventStore::default());
        let progress = Arc::new(MapProgressTracker::default());
        let seen = Seen::default();
        let bad = "/book/bad";
        let bad_partition = partition_of(bad);
        let good: Vec<String> = (0..64)
            .map(|i| format!("/book/{i}"))
            .filter(|path| partition_of(path) != bad_partition)
            .take(3)
            .collect();

        let last_good_on_bad = add_page(&store, bad, 5).await;
        for path in &good {
            add_page(&store, path, 1).await;
        }
        add_page(&store, bad, 0).await;
        add_page(&store, bad, 7).await;
        for path in &good {
            add_page(&store, path, 2).await;
        }

        let report = run_to_end(&store, &progress, &seen).await;

        assert_eq!(report.failed_partitions().collect::<Vec<_>>(), vec![bad_partition]);
        assert!(matches!(
            report.failure(bad_partition),
            Some(EventHandlingError::HandlerFailed { .. })
        ));
        assert_eq!(report.handled(bad_partition), 1);
        assert_eq!(
            progress.committed(&PartitionKey::new("default", bad_partition)),
            Some(last_good_on_bad)
        );
        let seen = seen.lock();
        assert_eq!(seen.iter().filter(|(s, _)| s == bad).count(), 1);
        for path in &good {
            assert_eq!(seen.iter().filter(|(s, _)| s == path).count(), 2);
        }
        assert!(logs_contain("Event handling failed, partition stopped"));
    }

    #[tokio::test]
    async fn restarted_processors_skip_committed_events() {
        let store = Arc::new(VecEventStore::default());
        let progress = Arc::new(MapProgressTracker::default());
        let seen = Seen::default();
        for book in ["/book/1", "/book/2", "/book/3"] {
            add_page(&store, book, 1).await;
        }

        let first = run_to_end(&store, &progress, &seen).await;
        let second = run_to_end(&store, &progress, &seen).await;
        let latest = add_page(&store, "/book/2", 9).await;
        let third = run_to_end(&store, &progress, &seen).await;

        assert_eq!(first.total_handled(), 3);
        assert_eq!(second.total_handled(), 0);
        assert_eq!(third.total_handled(), 1);
        assert_eq!(seen.lock().len(), 4);
        assert_eq!(seen.lock().last(), Some(&("/book/2".to_string(), latest)));
    }

    #[tokio::test]
    async fn handlers_see_upcasted_events() {
        let store = Arc::new(VecEventStore::default());
        let progress = Arc::new(MapProgressTracker::default());
        let seen = Seen::default();
        let book = subject("/book/1/page/4");
        let mut legacy = candidate::<PageAdded>(&book, json!({ "words": 12 }));
        legacy.event_type = EventType::try_new("page.added.v0").unwrap();
        store.append(&book, SubjectCondition::None, vec![legacy]).await.unwrap();

        let upcasters = UpcasterChain::new().with(EventTypeUpcaster::new(
            EventType::try_new("page.added.v0").unwrap(),
            EventType::try_new(PageAdded::EVENT_TYPE).unwrap(),
        ));
        let report = EventHandlingProcessor::builder(store.clone(), progress.clone())
            .with_resolver(Arc::new(PerLevelSubjectSequenceResolver::new(
                LevelsToKeep::try_new(2).unwrap(),
            )))
            .with_upcasters(upcasters)
            .with_handler(recording_handler(&seen))
            .build()
            .run(futures::future::pending())
            .await
            .unwrap();

        assert_eq!(report.total_handled(), 1);
        assert_eq!(seen.lock()[0].0, "/book/1/page/4");
        assert_eq!(
            progress.committed(&PartitionKey::new("default", partition_of("/book/1"))),
            Some(EventId::first())
        );
    }

    #[tokio::test]
    async fn subscription_failures_stop_the_run() {
        struct BrokenStore(VecEventStore);

        #[async_trait::async_trait]
        impl EventStore for BrokenStore {
            async fn append(
                &self,
                subject: &Subject,
                condition: SubjectCondition,
                candidates: Vec<crate::event::EventCandidate>,
            ) -> crate::errors::EventStoreResult<Vec<Event>> {
                self.0.append(subject, condition, candidates).await
            }

            async fn read_events(
                &self,
                subject: &Subject,
                options: &crate::event_store::ReadOptions,
            ) -> crate::errors::EventStoreResult<Vec<Event>> {
                self.0.read_events(subject, options).await
            }

            async fn subscribe(
                &self,
                _after: Option<EventId>,
            ) -> crate::errors::EventStoreResult<crate::event_store::EventStream> {
                Ok(Box::pin(futures::stream::iter(vec![Err(
                    crate::errors::EventStoreError::Unavailable("connection reset".to_string()),
                )])))
            }
        }

        let progress = Arc::new(MapProgressTracker::default());
        let store = Arc::new(BrokenStore(VecEventStore::default()));
        let result = EventHandlingProcessor::builder(store, progress)
            .build()
            .run(futures::future::pending())
            .await;

        assert!(matches!(result, Err(EventHandlingError::Subscription(_))));
    }
}
