//! Tag aggregation across detector outputs.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::pipeline::model::DetectionResult;

/// Ordered, lower-cased, deduplicated labels for one item.
///
/// Entries keep the order in which they were first seen. No two entries
/// compare equal ignoring case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(Vec<String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize and deduplicate an arbitrary label sequence.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for label in labels {
            let Some(normalized) = normalize_label(label.as_ref()) else {
                continue;
            };
            if seen.insert(normalized.clone()) {
                out.push(normalized);
            }
        }
        Self(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, label: &str) -> bool {
        normalize_label(label).is_some_and(|needle| self.0.contains(&needle))
    }
}

impl<'a> IntoIterator for &'a TagSet {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Merge the labels of every detector result, in submission order.
///
/// Failed detectors carry no labels and therefore contribute nothing.
pub fn aggregate<'a, I>(results: I) -> TagSet
where
    I: IntoIterator<Item = &'a DetectionResult>,
{
    TagSet::from_labels(
        results
            .into_iter()
            .flat_map(|result| result.labels.iter().map(String::as_str)),
    )
}

fn normalize_label(label: &str) -> Option<String> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn completed(detector: &str, labels: &[&str]) -> DetectionResult {
        DetectionResult::completed(detector, labels.iter().map(|l| l.to_string()).collect())
    }

    #[test]
    fn overlapping_labels_collapse_case_insensitively() {
        let results = vec![
            completed("object", &["Car", "car"]),
            completed("ocr", &["dog"]),
            completed("semantic", &["CAR", "tree"]),
        ];
        let tags = aggregate(&results);
        assert_eq!(tags.as_slice(), ["car", "dog", "tree"]);
    }

    #[test]
    fn empty_results_yield_empty_tagset() {
        let tags = aggregate(&Vec::<DetectionResult>::new());
        assert!(tags.is_empty());
    }

    #[test]
    fn whitespace_only_labels_are_dropped() {
        let tags = TagSet::from_labels(["  ", " Person ", "person", ""]);
        assert_eq!(tags.as_slice(), ["person"]);
        assert!(tags.contains("PERSON"));
    }

    #[test]
    fn tagset_serializes_as_plain_array() {
        let tags = TagSet::from_labels(["b", "A"]);
        let json = serde_json::to_string(&tags).expect("serialize");
        assert_eq!(json, r#"["b","a"]"#);
    }

    proptest! {
        #[test]
        fn aggregation_is_idempotent_and_case_unique(
            groups in proptest::collection::vec(
                proptest::collection::vec("[a-zA-Z ]{0,6}", 0..6),
                0..4,
            )
        ) {
            let results: Vec<DetectionResult> = groups
                .iter()
                .enumerate()
                .map(|(idx, labels)| DetectionResult::completed(format!("d{idx}"), labels.clone()))
                .collect();

            let once = aggregate(&results);
            let twice = TagSet::from_labels(once.iter());
            prop_assert_eq!(&once, &twice);

            let mut seen = HashSet::new();
            for tag in once.iter() {
                prop_assert!(seen.insert(tag.to_lowercase()));
            }

            // First-seen order: each tag's first raw occurrence precedes the next tag's.
            let flat: Vec<String> = groups
                .iter()
                .flatten()
                .filter_map(|label| normalize_label(label))
                .collect();
            let positions: Vec<usize> = once
                .iter()
                .map(|tag| flat.iter().position(|raw| raw == tag).expect("tag originates in input"))
                .collect();
            prop_assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
