//! Process-wide per-collection progress counters.
//!
//! The aggregator is shared by the bulk copier and the change applier and
//! exposed read-only to monitoring through [`ProgressAggregator::snapshot`].
//! Counters are monotonic per collection except on explicit reset; no
//! ordering is guaranteed across collections.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Lifecycle state of a collection's replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionState {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct ProgressRecord {
    total_docs: u64,
    migrated_docs: u64,
    updates_applied: u64,
    deletions_applied: u64,
    source_count: u64,
    target_count: u64,
    last_update: DateTime<Utc>,
    state: CollectionState,
}

impl ProgressRecord {
    fn new() -> Self {
        ProgressRecord {
            total_docs: 0,
            migrated_docs: 0,
            updates_applied: 0,
            deletions_applied: 0,
            source_count: 0,
            target_count: 0,
            last_update: Utc::now(),
            state: CollectionState::Pending,
        }
    }
}

/// Read-only progress view for one collection.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub collection: String,
    pub progress_pct: f64,
    pub source_count: u64,
    pub target_count: u64,
    pub updates_applied: u64,
    pub deletions_applied: u64,
    pub last_update: DateTime<Utc>,
    pub state: CollectionState,
}

/// Shared, cheaply clonable counter registry keyed by collection.
#[derive(Clone, Default)]
pub struct ProgressAggregator {
    inner: Arc<Mutex<BTreeMap<String, ProgressRecord>>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        ProgressAggregator::default()
    }

    fn update<F: FnOnce(&mut ProgressRecord)>(&self, collection: &str, f: F) {
        let mut map = self.inner.lock().expect("progress lock poisoned");
        let record = map
            .entry(collection.to_string())
            .or_insert_with(ProgressRecord::new);
        f(record);
        record.last_update = Utc::now();
    }

    pub fn register(&self, collection: &str) {
        self.update(collection, |_| {});
    }

    pub fn set_state(&self, collection: &str, state: CollectionState) {
        self.update(collection, |r| r.state = state);
    }

    pub fn set_total(&self, collection: &str, total_docs: u64) {
        self.update(collection, |r| r.total_docs = total_docs);
    }

    pub fn set_counts(&self, collection: &str, source_count: u64, target_count: u64) {
        self.update(collection, |r| {
            r.source_count = source_count;
            r.target_count = target_count;
        });
    }

    pub fn add_migrated(&self, collection: &str, n: u64) {
        self.update(collection, |r| r.migrated_docs += n);
    }

    pub fn add_updates(&self, collection: &str, n: u64) {
        self.update(collection, |r| r.updates_applied += n);
    }

    pub fn add_deletions(&self, collection: &str, n: u64) {
        self.update(collection, |r| r.deletions_applied += n);
    }

    /// Clear a collection's counters (force-refresh path).
    pub fn reset(&self, collection: &str) {
        self.update(collection, |r| *r = ProgressRecord::new());
    }

    /// Whether any collection has been marked failed.
    pub fn any_failed(&self) -> bool {
        let map = self.inner.lock().expect("progress lock poisoned");
        map.values().any(|r| r.state == CollectionState::Failed)
    }

    /// Point-in-time snapshot of every registered collection, in collection
    /// name order.
    pub fn snapshot(&self) -> Vec<ProgressSnapshot> {
        let map = self.inner.lock().expect("progress lock poisoned");
        map.iter()
            .map(|(collection, r)| ProgressSnapshot {
                collection: collection.clone(),
                progress_pct: progress_pct(r),
                source_count: r.source_count,
                target_count: r.target_count,
                updates_applied: r.updates_applied,
                deletions_applied: r.deletions_applied,
                last_update: r.last_update,
                state: r.state,
            })
            .collect()
    }

    /// Snapshot for a single collection, if registered.
    pub fn get(&self, collection: &str) -> Option<ProgressSnapshot> {
        self.snapshot()
            .into_iter()
            .find(|s| s.collection == collection)
    }
}

fn progress_pct(r: &ProgressRecord) -> f64 {
    if r.total_docs == 0 {
        return match r.state {
            CollectionState::Pending => 0.0,
            _ => 100.0,
        };
    }
    (r.migrated_docs as f64 / r.total_docs as f64 * 100.0).min(100.0)
}
