//! Sequence resolution for partitioned event handling.
//!
//! Event handling workers process different partitions in parallel while
//! every partition is processed strictly in order. An
//! [`EventSequenceResolver`] maps an event to a sequence id; events with the
//! same sequence id always land on the same partition. The id is a
//! partitioning key for ordering and parallelism, not a cache key.

use crate::config::{LevelsToKeep, PartitionCount};
use crate::event::Event;
use crate::types::{Subject, SUBJECT_SEPARATOR};

/// Maps an event to the id of the sequence it must be handled in.
pub trait EventSequenceResolver: Send + Sync {
    /// The sequence id of `event`.
    fn sequence_id(&self, event: &Event) -> String;
}

/// Every subject is its own sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerSubjectSequenceResolver;

impl EventSequenceResolver for PerSubjectSequenceResolver {
    fn sequence_id(&self, event: &Event) -> String {
        event.subject.to_string()
    }
}

/// Subjects sharing their first `levels_to_keep` segments form one sequence.
///
/// With two levels, all events below `/book/4711` are handled in order
/// relative to each other, while different books are handled in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerLevelSubjectSequenceResolver {
    levels_to_keep: LevelsToKeep,
}

impl PerLevelSubjectSequenceResolver {
    /// Creates a resolver keeping `levels_to_keep` leading segments.
    pub const fn new(levels_to_keep: LevelsToKeep) -> Self {
        Self { levels_to_keep }
    }
}

impl EventSequenceResolver for PerLevelSubjectSequenceResolver {
    fn sequence_id(&self, event: &Event) -> String {
        truncate_subject(&event.subject, self.levels_to_keep)
    }
}

/// Truncates `subject` to its first `levels_to_keep` segments.
///
/// Never extends a path. The root truncates to itself.
pub fn truncate_subject(subject: &Subject, levels_to_keep: LevelsToKeep) -> String {
    let path = subject.as_ref();
    path.match_indices(SUBJECT_SEPARATOR)
        .nth(levels_to_keep.into_inner())
        .map_or_else(|| path.to_string(), |(cut, _)| path[..cut].to_string())
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Maps a sequence id to a partition index in `0..partition_count`.
///
/// Uses the 64 bit FNV-1a hash of the id's UTF-8 bytes. Progress is
/// checkpointed per partition, so the mapping must never change between
/// builds or toolchains.
pub fn partition_for(sequence_id: &str, partition_count: PartitionCount) -> u32 {
    let hash = sequence_id.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    let partitions = u64::from(partition_count.into_inner());
    u32::try_from(hash % partitions).unwrap_or(0)
}
