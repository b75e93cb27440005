//! Audit trail of engine activity.
//!
//! Every internal event lands here with a category tag (`fact`, `rule`,
//! `timer`, `temporal`, `engine`). The in-memory ring is bounded; with a
//! storage adapter configured, entries also accumulate into day-bucketed
//! payloads under `audit:{category}:{yyyy-mm-dd}`.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{Persisted, StorageAdapter};
use crate::value::Value;

/// One audited engine action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Category bucket (`fact`, `rule`, `timer`, `temporal`, `engine`).
    pub category: String,
    /// Action name, matching the internal event topic.
    pub action: String,
    /// Identity of the affected entity (fact key, rule id, timer name).
    pub entity_id: String,
    /// Structured detail.
    pub payload: Value,
}

#[derive(Serialize, Deserialize, Default)]
struct BucketState {
    entries: Vec<AuditEntry>,
}

/// Bounded audit ring with write-behind bucket persistence.
pub struct AuditLog {
    capacity: usize,
    entries: VecDeque<AuditEntry>,
    /// Entries recorded since the last flush.
    pending: Vec<AuditEntry>,
}

impl AuditLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            pending: Vec::new(),
        }
    }

    /// Appends an entry, dropping the oldest retained one on overflow.
    pub fn record(&mut self, entry: AuditEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        self.pending.push(entry);
    }

    /// Retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Retained entries for one category, oldest first.
    #[must_use]
    pub fn by_category(&self, category: &str) -> Vec<AuditEntry> {
        self.entries
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// Appends pending entries into their day buckets on the adapter.
    pub fn flush_to(&mut self, adapter: &dyn StorageAdapter, server_id: &str, now: DateTime<Utc>) {
        if self.pending.is_empty() {
            return;
        }

        let mut buckets: BTreeMap<String, Vec<AuditEntry>> = BTreeMap::new();
        for entry in self.pending.drain(..) {
            let key = format!(
                "audit:{}:{}",
                entry.category,
                entry.timestamp.format("%Y-%m-%d")
            );
            buckets.entry(key).or_default().push(entry);
        }

        for (key, new_entries) in buckets {
            let mut state = match adapter.load(&key) {
                Ok(Some(payload)) => payload.unwrap_state::<BucketState>().unwrap_or_default(),
                Ok(None) => BucketState::default(),
                Err(e) => {
                    warn!(%key, error = %e, "failed to load audit bucket");
                    BucketState::default()
                }
            };
            state.entries.extend(new_entries);

            match Persisted::wrap(&state, server_id, now) {
                Ok(payload) => {
                    if let Err(e) = adapter.save(&key, &payload) {
                        warn!(%key, error = %e, "failed to persist audit bucket");
                    }
                }
                Err(e) => warn!(%key, error = %e, "failed to serialize audit bucket"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;

    fn entry(category: &str, action: &str) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            category: category.to_string(),
            action: action.to_string(),
            entity_id: "e1".to_string(),
            payload: Value::Null,
        }
    }

    #[test]
    fn test_ring_bounds_retention() {
        let mut log = AuditLog::new(2);
        log.record(entry("fact", "fact_created"));
        log.record(entry("fact", "fact_updated"));
        log.record(entry("fact", "fact_deleted"));

        let actions: Vec<String> = log.entries().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["fact_updated", "fact_deleted"]);
    }

    #[test]
    fn test_by_category() {
        let mut log = AuditLog::new(16);
        log.record(entry("fact", "fact_created"));
        log.record(entry("rule", "rule_registered"));
        log.record(entry("fact", "fact_deleted"));

        assert_eq!(log.by_category("fact").len(), 2);
        assert_eq!(log.by_category("rule").len(), 1);
        assert!(log.by_category("timer").is_empty());
    }

    #[test]
    fn test_flush_appends_to_buckets() {
        let adapter = MemoryAdapter::new();
        let now = Utc::now();
        let mut log = AuditLog::new(16);

        log.record(entry("fact", "fact_created"));
        log.flush_to(&adapter, "engine-1", now);

        log.record(entry("fact", "fact_updated"));
        log.flush_to(&adapter, "engine-1", now);

        let keys = adapter.list_keys(Some("audit:fact:")).unwrap();
        assert_eq!(keys.len(), 1);
        let payload = adapter.load(&keys[0]).unwrap().unwrap();
        let state: BucketState = payload.unwrap_state().unwrap();
        assert_eq!(state.entries.len(), 2);

        // Nothing pending: another flush is a no-op.
        adapter.delete(&keys[0]).unwrap();
        log.flush_to(&adapter, "engine-1", now);
        assert!(adapter.list_keys(Some("audit:")).unwrap().is_empty());
    }
}
