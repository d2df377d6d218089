//! Metadata propagation between a command and the events it produces.
//!
//! When a command is sent, the caller can pass metadata (a user id, a
//! correlation id, ...). Each event the handler publishes may carry its own
//! metadata as well. [`MetaDataPropagationMode`] decides how the two are
//! combined before the events are appended.

use crate::event::Metadata;
use serde::{Deserialize, Serialize};

/// How metadata passed to `send` is merged into each published event's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetaDataPropagationMode {
    /// Command metadata is dropped; events keep only their own metadata.
    None,
    /// Command metadata fills keys the event does not set itself.
    #[default]
    KeepIfPresent,
    /// Command metadata replaces the event's values on key collision.
    OverrideIfPresent,
}

/// Merges `source` into `destination` according to `mode`.
///
/// `destination` is the metadata the handler attached to an event, `source`
/// the metadata the command was sent with.
pub fn propagate_metadata(
    mut destination: Metadata,
    source: &Metadata,
    mode: MetaDataPropagationMode,
) -> Metadata {
    match mode {
        MetaDataPropagationMode::None => {}
        MetaDataPropagationMode::KeepIfPresent => {
            for (key, value) in source {
                destination
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        MetaDataPropagationMode::OverrideIfPresent => {
            destination.extend(source.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    destination
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn metadata(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn none_keeps_destination_unchanged() {
        let destination = metadata(&[("user", "alice")]);
        let source = metadata(&[("user", "bob"), ("trace", "t-1")]);

        let merged =
            propagate_metadata(destination.clone(), &source, MetaDataPropagationMode::None);

        assert_eq!(merged, destination);
        assert!(!merged.contains_key("trace"));
    }

    #[test]
    fn keep_if_present_preserves_destination_on_collision() {
        let merged = propagate_metadata(
            metadata(&[("user", "alice")]),
            &metadata(&[("user", "bob"), ("trace", "t-1")]),
            MetaDataPropagationMode::KeepIfPresent,
        );

        assert_eq!(merged, metadata(&[("user", "alice"), ("trace", "t-1")]));
    }

    #[test]
    fn override_if_present_takes_source_on_collision() {
        let merged = propagate_metadata(
            metadata(&[("user", "alice")]),
            &metadata(&[("user", "bob"), ("trace", "t-1")]),
            MetaDataPropagationMode::OverrideIfPresent,
        );

        assert_eq!(merged, metadata(&[("user", "bob"), ("trace", "t-1")]));
    }

    proptest! {
        #[test]
        fn disjoint_keys_merge_to_union(
            dest in prop::collection::hash_map("d[a-z]{1,6}", "[a-z]{0,6}", 0..6),
            src in prop::collection::hash_map("s[a-z]{1,6}", "[a-z]{0,6}", 0..6),
        ) {
            let to_metadata = |map: &std::collections::HashMap<String, String>| -> Metadata {
                map.iter().map(|(k, v)| (k.clone(), json!(v))).collect()
            };
            let destination = to_metadata(&dest);
            let source = to_metadata(&src);
            let mut union = destination.clone();
            union.extend(source.clone());

            for mode in [
                MetaDataPropagationMode::KeepIfPresent,
                MetaDataPropagationMode::OverrideIfPresent,
            ] {
                prop_assert_eq!(
                    propagate_metadata(destination.clone(), &source, mode),
                    union.clone()
                );
            }
            prop_assert_eq!(
                propagate_metadata(destination.clone(), &source, MetaDataPropagationMode::None),
                destination
            );
        }
    }
}
