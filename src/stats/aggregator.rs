// src/stats/aggregator.rs
use dashmap::DashMap;
use std::collections::BTreeMap;

/// Cumulative response bytes per request path.
///
/// Each update holds the shard lock for its key across the whole
/// read-modify-write, so concurrent updates are never lost.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    totals: DashMap<String, u64>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `delta` to the total for `path` and returns the new total.
    pub fn update(&self, path: &str, delta: u64) -> u64 {
        if let Some(mut total) = self.totals.get_mut(path) {
            *total = total.saturating_add(delta);
            return *total;
        }

        let mut total = self.totals.entry(path.to_owned()).or_insert(0);
        *total = total.saturating_add(delta);
        *total
    }

    pub fn get(&self, path: &str) -> Option<u64> {
        self.totals.get(path).map(|total| *total)
    }

    /// Point-in-time copy of every total, ordered by path.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.totals
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}
