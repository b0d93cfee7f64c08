//! Usage Aggregation
//!
//! Counts how often each [`UsageKey`] is seen while the page stream is consumed. The
//! build phase ([`UsageAggregator`]) is mutable and owned by the extraction pass; once it
//! is finished the counts are frozen into a [`UsageTally`] that can only be read, and
//! read through a [`TallyCursor`] only once.
//!
//! Keys are reported in the order they were first seen. Each key is stored once: the
//! map value remembers its first-seen position and the order is restored when the
//! tally is frozen.

use crate::models::UsageKey;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: u64,
    first_seen: usize,
}

#[derive(Debug, Default)]
pub struct UsageAggregator {
    slots: HashMap<UsageKey, Slot>,
    total: u64,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: UsageKey) {
        let next_position = self.slots.len();
        self.slots
            .entry(key)
            .and_modify(|slot| slot.count += 1)
            .or_insert(Slot {
                count: 1,
                first_seen: next_position,
            });
        self.total += 1;
    }

    pub fn count(&self, key: &UsageKey) -> u64 {
        self.slots.get(key).map(|slot| slot.count).unwrap_or(0)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Sum of all increments.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn finish(self) -> UsageTally {
        let mut ordered: Vec<(usize, UsageKey, u64)> = self
            .slots
            .into_iter()
            .map(|(key, slot)| (slot.first_seen, key, slot.count))
            .collect();
        ordered.sort_unstable_by_key(|(first_seen, _, _)| *first_seen);

        UsageTally {
            entries: ordered
                .into_iter()
                .map(|(_, key, count)| (key, count))
                .collect(),
        }
    }
}

/// Frozen (key, count) pairs in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageTally {
    entries: Vec<(UsageKey, u64)>,
}

impl UsageTally {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &UsageKey) -> Option<u64> {
        self.entries
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, count)| *count)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UsageKey, u64)> {
        self.entries.iter().map(|(key, count)| (key, *count))
    }

    pub fn into_cursor(self) -> TallyCursor {
        TallyCursor {
            inner: self.entries.into_iter(),
        }
    }
}

/// One-shot forward cursor over a tally. Exhaustion is permanent.
#[derive(Debug)]
pub struct TallyCursor {
    inner: std::vec::IntoIter<(UsageKey, u64)>,
}

impl TallyCursor {
    pub fn remaining(&self) -> usize {
        self.inner.len()
    }
}

impl Iterator for TallyCursor {
    type Item = (UsageKey, u64);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for TallyCursor {}
impl std::iter::FusedIterator for TallyCursor {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TableReference;

    fn key(table: &str, email: &str) -> UsageKey {
        UsageKey::table_level(
            &TableReference {
                project_id: "p".to_string(),
                dataset_id: "d".to_string(),
                table_id: table.to_string(),
            },
            email,
        )
    }

    #[test]
    fn test_record_counts_repeats() {
        let mut aggregator = UsageAggregator::new();
        for _ in 0..5 {
            aggregator.record(key("t", "a@x.com"));
        }
        aggregator.record(key("t", "b@x.com"));

        assert_eq!(aggregator.count(&key("t", "a@x.com")), 5);
        assert_eq!(aggregator.count(&key("t", "b@x.com")), 1);
        assert_eq!(aggregator.count(&key("u", "a@x.com")), 0);
        assert_eq!(aggregator.len(), 2);
        assert_eq!(aggregator.total(), 6);
    }

    #[test]
    fn test_tally_keeps_first_seen_order() {
        let mut aggregator = UsageAggregator::new();
        aggregator.record(key("c", "a@x.com"));
        aggregator.record(key("a", "a@x.com"));
        aggregator.record(key("c", "a@x.com"));
        aggregator.record(key("b", "a@x.com"));
        aggregator.record(key("a", "a@x.com"));

        let tables: Vec<(String, u64)> = aggregator
            .finish()
            .into_cursor()
            .map(|(key, count)| (key.table, count))
            .collect();
        assert_eq!(
            tables,
            vec![
                ("c".to_string(), 2),
                ("a".to_string(), 2),
                ("b".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_cursor_is_one_shot() {
        let mut aggregator = UsageAggregator::new();
        aggregator.record(key("t", "a@x.com"));
        let tally = aggregator.finish();
        assert_eq!(tally.get(&key("t", "a@x.com")), Some(1));

        let mut cursor = tally.into_cursor();
        assert_eq!(cursor.remaining(), 1);
        assert!(cursor.next().is_some());
        assert!(cursor.next().is_none());
        assert!(cursor.next().is_none());
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_empty_aggregator_finishes_empty() {
        let tally = UsageAggregator::new().finish();
        assert!(tally.is_empty());
        assert_eq!(tally.into_cursor().next(), None);
    }
}
