//! Deduplication of existing and incoming records.

use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use crate::domain::{CanonicalRecord, ProviderKind};

/// Rank of a provider in the priority list; unlisted providers rank last.
fn rank(priority: &[ProviderKind], provider: ProviderKind) -> usize {
    priority
        .iter()
        .position(|p| *p == provider)
        .unwrap_or(priority.len())
}

/// True if `candidate` should replace `current` for the same key.
///
/// Higher priority wins; equal priority goes to the later `fetched_at`; a full
/// tie goes to the candidate.
pub fn replaces(
    current: &CanonicalRecord,
    candidate: &CanonicalRecord,
    priority: &[ProviderKind],
) -> bool {
    match rank(priority, candidate.provider).cmp(&rank(priority, current.provider)) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => candidate.fetched_at >= current.fetched_at,
    }
}

/// Union of `existing` and `incoming`, one record per `(timestamp, symbol)`,
/// sorted ascending by that key.
pub fn dedup(
    existing: Vec<CanonicalRecord>,
    incoming: Vec<CanonicalRecord>,
    priority: &[ProviderKind],
) -> Vec<CanonicalRecord> {
    let mut by_key: BTreeMap<(DateTime<Utc>, String), CanonicalRecord> = BTreeMap::new();
    for record in existing.into_iter().chain(incoming) {
        match by_key.entry((record.timestamp, record.symbol.clone())) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                if replaces(slot.get(), &record, priority) {
                    slot.insert(record);
                }
            }
        }
    }
    by_key.into_values().collect()
}
