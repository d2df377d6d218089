use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use subjectcore::errors::{EventStoreError, EventStoreResult};
use subjectcore::event::{Event, EventCandidate};
use subjectcore::event_store::{EventStore, EventStream, ReadOptions};
use subjectcore::types::{EventId, Subject, Timestamp};
use subjectcore::SubjectCondition;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, instrument, warn};

const DEFAULT_SOURCE: &str = "subjectcore-memory";
const DEFAULT_FEED_CAPACITY: usize = 1024;

#[derive(Default)]
struct Log {
    events: Vec<Event>,
    subjects: HashSet<Subject>,
    next_id: Option<EventId>,
}

impl Log {
    fn next_id(&self) -> EventId {
        self.next_id.unwrap_or_else(EventId::first)
    }
}

/// Thread-safe in-memory event store
///
/// All events live in one global log. Clones share the log, so a clone can be
/// handed to a router and another to an event handling processor.
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
    feed: broadcast::Sender<Event>,
    source: Arc<str>,
}

impl InMemoryEventStore {
    /// Create a new empty in-memory event store
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(DEFAULT_FEED_CAPACITY);
        Self {
            log: Arc::default(),
            feed,
            source: Arc::from(DEFAULT_SOURCE),
        }
    }

    /// Records `source` as the producing application of appended events.
    #[must_use]
    pub fn with_source(mut self, source: impl AsRef<str>) -> Self {
        self.source = Arc::from(source.as_ref());
        self
    }

    /// Buffers up to `capacity` live events per subscriber. A subscriber
    /// falling further behind fails with `EventStoreError::Unavailable`.
    ///
    /// Must be called before anyone subscribes.
    #[must_use]
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        self.feed = feed;
        self
    }

    /// A copy of every stored event in store order.
    pub fn events(&self) -> Vec<Event> {
        self.log.read().events.clone()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.log.read().events.len()
    }

    /// Returns `true` if nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.log.read().events.is_empty()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("source", &self.source)
            .field("events", &self.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    #[instrument(skip(self, candidates), fields(subject = %subject, events = candidates.len()))]
    async fn append(
        &self,
        subject: &Subject,
        condition: SubjectCondition,
        candidates: Vec<EventCandidate>,
    ) -> EventStoreResult<Vec<Event>> {
        let mut log = self.log.write();

        if !condition.matches(log.subjects.contains(subject)) {
            debug!(%condition, "Append rejected");
            return Err(EventStoreError::ConditionViolation {
                subject: subject.clone(),
                condition,
            });
        }

        let time = Timestamp::now();
        let mut next = log.next_id();
        let mut appended = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let event = candidate.into_event(next, self.source.as_ref(), time);
            next = next.next();
            log.subjects.insert(event.subject.clone());
            log.events.push(event.clone());
            // Sent under the write lock so subscribers see store order.
            self.feed.send(event.clone()).ok();
            appended.push(event);
        }
        log.next_id = Some(next);
        drop(log);

        Ok(appended)
    }

    async fn read_events(
        &self,
        subject: &Subject,
        options: &ReadOptions,
    ) -> EventStoreResult<Vec<Event>> {
        let log = self.log.read();
        let start = options
            .after
            .map_or(0, |after| log.events.partition_point(|event| event.id <= after));
        Ok(log.events[start..]
            .iter()
            .filter(|event| options.selects(subject, &event.subject, event.id))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, after: Option<EventId>) -> EventStoreResult<EventStream> {
        let (history, receiver) = {
            let log = self.log.read();
            let receiver = self.feed.subscribe();
            let history: Vec<Event> = log
                .events
                .iter()
                .filter(|event| after.map_or(true, |after| event.id > after))
                .cloned()
                .collect();
            (history, receiver)
        };
        let replayed_up_to = history.last().map(|event| event.id).or(after);

        let live = futures::stream::unfold(
            (receiver, replayed_up_to),
            |(mut receiver, seen)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if seen.is_some_and(|seen| event.id <= seen) => continue,
                        Ok(event) => {
                            let seen = Some(event.id);
                            return Some((Ok(event), (receiver, seen)));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Subscriber lagged behind the live feed");
                            let error = EventStoreError::Unavailable(format!(
                                "subscriber fell behind by {skipped} events"
                            ));
                            return Some((Err(error), (receiver, seen)));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(futures::stream::iter(history.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }

    async fn subject_exists(&self, subject: &Subject) -> EventStoreResult<bool> {
        Ok(self.log.read().subjects.contains(subject))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tracing_test::traced_test;
    use subjectcore::event::Metadata;
    use subjectcore::types::EventType;
    use subjectcore::SourcingMode;

    fn subject(path: &str) -> Subject {
        Subject::try_new(path).unwrap()
    }

    fn page(path: &str, words: u64) -> EventCandidate {
        EventCandidate {
            subject: subject(path),
            event_type: EventType::try_new("page.added.v1").unwrap(),
            payload: json!({ "words": words }),
            metadata: Metadata::new(),
        }
    }

    async fn append(
        store: &InMemoryEventStore,
        path: &str,
        condition: SubjectCondition,
    ) -> EventStoreResult<Vec<Event>> {
        store.append(&subject(path), condition, vec![page(path, 1)]).await
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = InMemoryEventStore::new();

        assert!(store.is_empty());
        assert!(!store.subject_exists(&subject("/book/1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let store = InMemoryEventStore::new();
        let clone = store.clone();

        append(&store, "/book/1", SubjectCondition::None).await.unwrap();

        assert_eq!(clone.len(), 1);
        assert!(clone.subject_exists(&subject("/book/1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_ids_follow_one_global_order() {
        let store = InMemoryEventStore::new().with_source("library");

        append(&store, "/book/1", SubjectCondition::None).await.unwrap();
        let second = store
            .append(
                &subject("/book/2"),
                SubjectCondition::None,
                vec![page("/book/2", 1), page("/book/2/page/1", 2)],
            )
            .await
            .unwrap();

        let ids: Vec<u64> = store.events().iter().map(|event| event.id.into()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(second[1].subject, subject("/book/2/page/1"));
        assert_eq!(second[0].source, "library");
    }

    #[tokio::test]
    async fn test_pristine_and_exists_conditions() {
        let store = InMemoryEventStore::new();

        assert!(matches!(
            append(&store, "/book/1", SubjectCondition::Exists).await,
            Err(EventStoreError::ConditionViolation { .. })
        ));
        append(&store, "/book/1", SubjectCondition::Pristine).await.unwrap();
        assert!(matches!(
            append(&store, "/book/1", SubjectCondition::Pristine).await,
            Err(EventStoreError::ConditionViolation { .. })
        ));
        append(&store, "/book/1", SubjectCondition::Exists).await.unwrap();

        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_conditions_only_consider_the_exact_subject() {
        let store = InMemoryEventStore::new();

        append(&store, "/book/1/page/1", SubjectCondition::None).await.unwrap();

        assert!(append(&store, "/book/1", SubjectCondition::Pristine).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_options_filtering() {
        let store = InMemoryEventStore::new();
        for path in ["/book/1", "/book/1/page/1", "/book/10", "/book/1"] {
            append(&store, path, SubjectCondition::None).await.unwrap();
        }
        let book = subject("/book/1");

        let local = store.read_events(&book, &ReadOptions::new(SourcingMode::Local)).await.unwrap();
        let recursive = store
            .read_events(&book, &ReadOptions::new(SourcingMode::Recursive))
            .await
            .unwrap();
        let newer = store
            .read_events(&book, &ReadOptions::new(SourcingMode::Recursive).after(EventId::first()))
            .await
            .unwrap();

        assert_eq!(local.len(), 2);
        assert_eq!(recursive.len(), 3);
        assert_eq!(newer.len(), 2);
        assert!(newer.iter().all(|event| event.id > EventId::first()));
    }

    #[tokio::test]
    async fn test_subscription_replays_history_then_follows_appends() {
        let store = InMemoryEventStore::new();
        append(&store, "/book/1", SubjectCondition::None).await.unwrap();
        append(&store, "/book/2", SubjectCondition::None).await.unwrap();

        let mut subscription = store.subscribe(Some(EventId::first())).await.unwrap();
        append(&store, "/book/3", SubjectCondition::None).await.unwrap();

        let replayed = subscription.next().await.unwrap().unwrap();
        let live = subscription.next().await.unwrap().unwrap();
        assert_eq!(replayed.subject, subject("/book/2"));
        assert_eq!(live.subject, subject("/book/3"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lagging_subscribers_fail_transiently() {
        let store = InMemoryEventStore::new().with_feed_capacity(1);
        let mut subscription = store.subscribe(None).await.unwrap();
        for book in ["/book/1", "/book/2", "/book/3"] {
            append(&store, book, SubjectCondition::None).await.unwrap();
        }

        let error = subscription.next().await.unwrap().unwrap_err();

        assert!(error.is_transient());
        assert!(logs_contain("Subscriber lagged behind the live feed"));
    }

    proptest! {
        #[test]
        fn ids_strictly_increase_in_read_order(
            paths in prop::collection::vec("/[a-c]{1}(/[0-3]{1}){0,2}", 1..30),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let store = InMemoryEventStore::new();
                for path in &paths {
                    append(&store, path, SubjectCondition::None).await.unwrap();
                }
                let events = store
                    .read_events(&Subject::root(), &ReadOptions::new(SourcingMode::Recursive))
                    .await
                    .unwrap();

                prop_assert_eq!(events.len(), paths.len());
                prop_assert!(events.windows(2).all(|pair| pair[0].id < pair[1].id));
                Ok(())
            })?;
        }
    }
}
