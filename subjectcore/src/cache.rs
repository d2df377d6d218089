//! Memoization of rebuilt state.
//!
//! The cache never serves a value older than one a concurrent rebuild has
//! already installed. All mutation goes through
//! [`StateRebuildingCache::fetch_and_merge`], which hands the previously
//! cached value to a rebuild function, runs it outside of any lock, and then
//! stores the candidate only if it is newer than what is stored by then.
//!
//! Rebuilt values are immutable snapshots shared through `Arc`; entries are
//! replaced, never mutated in place.

use crate::condition::SourcingMode;
use crate::config::CacheCapacity;
use crate::errors::{CommandResult, RebuildError};
use crate::state_reconstruction::RebuiltState;
use crate::types::{EventId, Subject};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Identifies one cached rebuild: subject, state type and sourcing mode.
///
/// The rebuilder is not part of the key. Every handler that decides on state
/// of type `S` in the same mode shares one entry per subject, so all
/// registrations for `S` must fold the same events the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    subject: Subject,
    state_type: TypeId,
    state_type_name: &'static str,
    mode: SourcingMode,
}

impl CacheKey {
    /// The key for state of type `S` rebuilt for `subject` in `mode`.
    pub fn of<S: 'static>(subject: Subject, mode: SourcingMode) -> Self {
        Self {
            subject,
            state_type: TypeId::of::<S>(),
            state_type_name: std::any::type_name::<S>(),
            mode,
        }
    }

    /// The rebuilt subject.
    pub const fn subject(&self) -> &Subject {
        &self.subject
    }

    /// The sourcing mode of the rebuild.
    pub const fn mode(&self) -> SourcingMode {
        self.mode
    }

    /// The Rust type name of the state.
    pub const fn state_type_name(&self) -> &'static str {
        self.state_type_name
    }

    fn is_affected_by(&self, written: &Subject) -> bool {
        &self.subject == written
            || (self.mode == SourcingMode::Recursive && self.subject.is_ancestor_of(written))
    }
}

/// An immutable, type-erased snapshot of rebuilt state.
#[derive(Clone)]
pub struct CacheValue {
    last_event_id: Option<EventId>,
    state: Arc<dyn Any + Send + Sync>,
    watermarks: Arc<HashMap<Subject, EventId>>,
}

impl CacheValue {
    /// Wraps a rebuilt state.
    pub fn from_rebuilt<S>(rebuilt: RebuiltState<S>) -> Self
    where
        S: Send + Sync + 'static,
    {
        Self {
            last_event_id: rebuilt.last_event_id,
            state: Arc::new(rebuilt.state),
            watermarks: Arc::new(rebuilt.watermarks),
        }
    }

    /// Unwraps into an owned rebuilt state of type `S`.
    pub fn to_rebuilt<S>(&self) -> Result<RebuiltState<S>, RebuildError>
    where
        S: Clone + 'static,
    {
        let state = self
            .state::<S>()
            .ok_or(RebuildError::StateTypeMismatch {
                expected: std::any::type_name::<S>(),
            })?
            .clone();
        Ok(RebuiltState {
            state,
            last_event_id: self.last_event_id,
            watermarks: self.watermarks.as_ref().clone(),
        })
    }

    /// The state, if it is of type `S`.
    pub fn state<S: 'static>(&self) -> Option<&S> {
        self.state.downcast_ref::<S>()
    }

    /// Id of the last event folded into the state.
    pub const fn last_event_id(&self) -> Option<EventId> {
        self.last_event_id
    }

    /// Highest event id per contributing subject.
    pub fn watermarks(&self) -> &HashMap<Subject, EventId> {
        &self.watermarks
    }

    /// Returns `true` if events of `subject` contributed to the state.
    pub fn mentions(&self, subject: &Subject) -> bool {
        self.watermarks.contains_key(subject)
    }

    /// Returns `true` if this value saw strictly newer events than `other`.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.last_event_id > other.last_event_id
    }
}

impl std::fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheValue")
            .field("last_event_id", &self.last_event_id)
            .field("watermarks", &self.watermarks)
            .finish_non_exhaustive()
    }
}

/// Produces a candidate value from the previously cached one.
pub type RebuildFn<'a> =
    Box<dyn FnOnce(Option<CacheValue>) -> BoxFuture<'a, CommandResult<CacheValue>> + Send + 'a>;

/// Boxes an async closure into a [`RebuildFn`].
pub fn rebuild_fn<'a, F, Fut>(rebuild: F) -> RebuildFn<'a>
where
    F: FnOnce(Option<CacheValue>) -> Fut + Send + 'a,
    Fut: Future<Output = CommandResult<CacheValue>> + Send + 'a,
{
    Box::new(move |previous| rebuild(previous).boxed())
}

/// A cache of rebuilt state.
#[async_trait]
pub trait StateRebuildingCache: Send + Sync {
    /// Rebuilds the value for `key` and merges it into the cache.
    ///
    /// `rebuild` receives the currently cached value, which may already be
    /// stale by the time it runs. Its result is stored only if nothing is
    /// stored for `key` or the stored value is older. Returns the value
    /// stored after the merge. A failed rebuild leaves the cache unchanged.
    async fn fetch_and_merge<'a>(
        &self,
        key: &CacheKey,
        rebuild: RebuildFn<'a>,
    ) -> CommandResult<CacheValue>;

    /// Drops every entry that events on `subject` could have made stale.
    fn invalidate(&self, subject: &Subject);
}

/// A cache that stores nothing and rebuilds on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStateRebuildingCache;

#[async_trait]
impl StateRebuildingCache for NoStateRebuildingCache {
    async fn fetch_and_merge<'a>(
        &self,
        _key: &CacheKey,
        rebuild: RebuildFn<'a>,
    ) -> CommandResult<CacheValue> {
        rebuild(None).await
    }

    fn invalidate(&self, _subject: &Subject) {}
}

type Slot = Arc<Mutex<Option<CacheValue>>>;

#[derive(Default)]
struct LruIndex {
    entries: HashMap<CacheKey, (Slot, u64)>,
    recency: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl LruIndex {
    fn touch(&mut self, key: &CacheKey) -> Option<Slot> {
        self.tick += 1;
        let tick = self.tick;
        let (slot, used) = self.entries.get_mut(key)?;
        self.recency.remove(&*used);
        *used = tick;
        self.recency.insert(tick, key.clone());
        Some(Arc::clone(slot))
    }

    fn slot_for_store(&mut self, key: &CacheKey, capacity: usize) -> Slot {
        if let Some(slot) = self.touch(key) {
            return slot;
        }
        let slot = Slot::default();
        self.entries.insert(key.clone(), (Arc::clone(&slot), self.tick));
        self.recency.insert(self.tick, key.clone());

        while self.entries.len() > capacity {
            let Some((_, evicted)) = self.recency.pop_first() else {
                break;
            };
            debug!(
                subject = %evicted.subject,
                state = evicted.state_type_name,
                "Evicting cache entry"
            );
            self.entries.remove(&evicted);
        }
        slot
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some((_, used)) = self.entries.remove(key) {
            self.recency.remove(&used);
        }
    }
}

/// A bounded cache evicting the least recently used entry on overflow.
///
/// The index lock only guards map and recency bookkeeping. The merge decision
/// for a key is taken under that key's own lock, and rebuilds run without any
/// lock held, so unrelated keys never wait on each other's rebuilds.
pub struct LruStateRebuildingCache {
    capacity: CacheCapacity,
    index: Mutex<LruIndex>,
}

impl LruStateRebuildingCache {
    /// Creates an empty cache holding at most `capacity` entries.
    pub fn new(capacity: CacheCapacity) -> Self {
        Self {
            capacity,
            index: Mutex::new(LruIndex::default()),
        }
    }

    /// The maximum number of entries.
    pub const fn capacity(&self) -> CacheCapacity {
        self.capacity
    }

    /// The current number of entries.
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if an entry for `key` is present.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.lock().entries.contains_key(key)
    }

    /// Returns the stored value for `key` without touching its recency.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheValue> {
        let slot = self.index.lock().entries.get(key).map(|(slot, _)| Arc::clone(slot))?;
        let value = slot.lock().clone();
        value
    }

    fn merge(slot: &Slot, candidate: CacheValue) -> CacheValue {
        let mut stored = slot.lock();
        match stored.as_ref() {
            Some(current) if !candidate.is_newer_than(current) => {
                debug!(
                    stored = ?current.last_event_id,
                    candidate = ?candidate.last_event_id,
                    "Keeping newer cached value"
                );
                current.clone()
            }
            _ => {
                *stored = Some(candidate.clone());
                candidate
            }
        }
    }
}

impl std::fmt::Debug for LruStateRebuildingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruStateRebuildingCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[async_trait]
impl StateRebuildingCache for LruStateRebuildingCache {
    #[instrument(
        skip(self, rebuild),
        fields(subject = %key.subject, state = key.state_type_name, mode = ?key.mode)
    )]
    async fn fetch_and_merge<'a>(
        &self,
        key: &CacheKey,
        rebuild: RebuildFn<'a>,
    ) -> CommandResult<CacheValue> {
        let slot = self.index.lock().touch(key);
        let previous = slot.and_then(|slot| slot.lock().clone());
        match &previous {
            Some(value) => debug!(last_event_id = ?value.last_event_id, "Cache hit"),
            None => debug!("Cache miss"),
        }

        let candidate = rebuild(previous).await?;

        let slot = self
            .index
            .lock()
            .slot_for_store(key, self.capacity.into_inner());
        Ok(Self::merge(&slot, candidate))
    }

    fn invalidate(&self, subject: &Subject) {
        let mut index = self.index.lock();
        let stale: Vec<CacheKey> = index
            .entries
            .iter()
            .filter(|(key, (slot, _))| {
                key.is_affected_by(subject)
                    || slot.lock().as_ref().is_some_and(|value| value.mentions(subject))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            index.remove(key);
        }
        if !stale.is_empty() {
            debug!(%subject, removed = stale.len(), "Invalidated cache entries");
        }
    }
}
