//! Configuration with type-safe validation.
//!
//! Every tunable is a `nutype` newtype validated at construction, so an
//! invalid configuration cannot be built. The structs deserialize with serde
//! and fall back to defaults for missing fields, which lets hosts load them
//! from whatever format they already use.

use crate::cache::{LruStateRebuildingCache, NoStateRebuildingCache, StateRebuildingCache};
use crate::metadata::MetaDataPropagationMode;
use nutype::nutype;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Maximum number of entries in an LRU state cache.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    default = 1024,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct CacheCapacity(usize);

/// Number of leading subject segments kept when deriving a sequence id.
#[nutype(
    validate(greater_or_equal = 1),
    default = 2,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct LevelsToKeep(usize);

/// Number of event handling partitions.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    default = 4,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Default,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct PartitionCount(u32);

/// Maximum number of attempts `send_with_retry` makes.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    default = 3,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct MaxRetryAttempts(u32);

/// Delay before the first retry in milliseconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10_000),
    default = 50,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryBaseDelayMs(u64);

impl RetryBaseDelayMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Upper bound of a single retry delay in milliseconds.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 300_000),
    default = 5_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryMaxDelayMs(u64);

impl RetryMaxDelayMs {
    /// Convert to Duration for use with `tokio::time::sleep`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Growth factor between consecutive retry delays.
#[nutype(
    validate(finite, greater_or_equal = 1.0, less_or_equal = 3.0),
    default = 2.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Into, Serialize, Deserialize)
)]
pub struct BackoffMultiplier(f64);

/// Number of events buffered per event handling worker.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65_536),
    default = 256,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct WorkerQueueDepth(usize);

/// Which state cache the router uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Every command rebuilds its state from the store.
    Disabled,
    /// A bounded LRU cache.
    Lru {
        /// Maximum number of entries
        #[serde(default)]
        capacity: CacheCapacity,
    },
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::Lru {
            capacity: CacheCapacity::default(),
        }
    }
}

impl CacheConfig {
    /// Builds the configured cache.
    pub fn build(self) -> Arc<dyn StateRebuildingCache> {
        match self {
            Self::Disabled => Arc::new(NoStateRebuildingCache),
            Self::Lru { capacity } => Arc::new(LruStateRebuildingCache::new(capacity)),
        }
    }
}

/// Exponential backoff for retrying transient command failures.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: MaxRetryAttempts,
    /// Delay before the first retry
    pub base_delay: RetryBaseDelayMs,
    /// Upper bound of any single delay
    pub max_delay: RetryMaxDelayMs,
    /// Growth factor between delays
    pub backoff_multiplier: BackoffMultiplier,
}

impl RetryConfig {
    /// The delay after `attempt` failed attempts, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.into_inner().powi(exponent);
        let max = self.max_delay.as_duration();
        let base = self.base_delay.as_duration();
        if !factor.is_finite() || factor * base.as_secs_f64() >= max.as_secs_f64() {
            return max;
        }
        base.mul_f64(factor)
    }

    /// The delay after `attempt` failed attempts, with ±25% jitter and
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter = rand::rng().random_range(0.75..=1.25);
        self.backoff(attempt)
            .mul_f64(jitter)
            .min(self.max_delay.as_duration())
    }
}

/// Configuration of a command router.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How `send` metadata reaches published events
    pub metadata_propagation: MetaDataPropagationMode,
    /// The state cache
    pub cache: CacheConfig,
    /// Retry policy of `send_with_retry`
    pub retry: RetryConfig,
}

/// Configuration of an event handling processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventHandlingConfig {
    /// Processing group name; part of every progress and lock key
    pub group: String,
    /// Number of partitions processed in parallel
    pub partitions: PartitionCount,
    /// Events buffered per partition worker
    pub queue_depth: WorkerQueueDepth,
}

impl Default for EventHandlingConfig {
    fn default() -> Self {
        Self {
            group: "default".to_string(),
            partitions: PartitionCount::default(),
            queue_depth: WorkerQueueDepth::default(),
        }
    }
}
