//! The fact store: a versioned keyed store of structured values.
//!
//! Keys are colon-delimited (`user:123:age`). Every `set` bumps the per-key
//! version, deep-equal writes included. The store is engine-private; callers
//! always receive independent snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::pattern::fact_pattern;
use crate::value::Value;

/// A stored fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Colon-delimited key.
    pub key: String,
    /// Current value.
    pub value: Value,
    /// Timestamp of the last mutation.
    pub timestamp: DateTime<Utc>,
    /// Strictly monotonic per-key version, starting at 1.
    pub version: u64,
    /// Identity of the last writer.
    pub source: String,
}

/// Outcome of a `set` describing the mutation that happened.
#[derive(Debug, Clone)]
pub struct FactWrite {
    /// Snapshot of the fact after the write.
    pub fact: Fact,
    /// The previous value, when the key already existed.
    pub previous: Option<Value>,
}

impl FactWrite {
    /// True when the write created the key.
    #[must_use]
    pub fn created(&self) -> bool {
        self.previous.is_none()
    }
}

/// In-memory keyed store with per-key versioning.
#[derive(Debug, Default)]
pub struct FactStore {
    facts: HashMap<String, Fact>,
}

impl FactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.facts.get(key).map(|f| &f.value)
    }

    /// Full fact snapshot for a key.
    #[must_use]
    pub fn get_full(&self, key: &str) -> Option<Fact> {
        self.facts.get(key).cloned()
    }

    /// Writes a value, creating the key or bumping its version.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: Value,
        source: impl Into<String>,
        now: DateTime<Utc>,
    ) -> FactWrite {
        let key = key.into();
        let source = source.into();

        match self.facts.get_mut(&key) {
            Some(existing) => {
                let previous = std::mem::replace(&mut existing.value, value);
                existing.version += 1;
                existing.timestamp = now;
                existing.source = source;
                FactWrite {
                    fact: existing.clone(),
                    previous: Some(previous),
                }
            }
            None => {
                let fact = Fact {
                    key: key.clone(),
                    value,
                    timestamp: now,
                    version: 1,
                    source,
                };
                self.facts.insert(key, fact.clone());
                FactWrite {
                    fact,
                    previous: None,
                }
            }
        }
    }

    /// Removes a key, returning the removed fact when it existed.
    pub fn delete(&mut self, key: &str) -> Option<Fact> {
        self.facts.remove(key)
    }

    /// All facts whose key matches the colon-glob pattern, ordered by key.
    #[must_use]
    pub fn query(&self, pattern: &str) -> Vec<Fact> {
        let matcher = fact_pattern(pattern);
        let mut out: Vec<Fact> = self
            .facts
            .values()
            .filter(|f| matcher.matches(&f.key))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Number of stored facts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    /// All facts, ordered by key. Used by the persistence flush.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Fact> {
        let mut out: Vec<Fact> = self.facts.values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Replaces the store contents from a persisted snapshot.
    pub fn restore(&mut self, facts: Vec<Fact>) {
        self.facts = facts.into_iter().map(|f| (f.key.clone(), f)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> FactStore {
        FactStore::new()
    }

    #[test]
    fn test_set_then_get() {
        let mut s = store();
        s.set("order:1:total", Value::Int(99), "test", Utc::now());
        assert_eq!(s.get("order:1:total"), Some(&Value::Int(99)));
        assert_eq!(s.get("order:2:total"), None);
    }

    #[test]
    fn test_version_strictly_increases() {
        let mut s = store();
        let now = Utc::now();

        let w1 = s.set("k", Value::Int(1), "test", now);
        assert_eq!(w1.fact.version, 1);
        assert!(w1.created());

        let w2 = s.set("k", Value::Int(2), "test", now);
        assert_eq!(w2.fact.version, 2);
        assert_eq!(w2.previous, Some(Value::Int(1)));

        // Deep-equal writes still bump the version.
        let w3 = s.set("k", Value::Int(2), "test", now);
        assert_eq!(w3.fact.version, 3);
    }

    #[test]
    fn test_delete() {
        let mut s = store();
        s.set("k", Value::Bool(true), "test", Utc::now());
        let removed = s.delete("k").unwrap();
        assert_eq!(removed.key, "k");
        assert_eq!(s.get("k"), None);
        assert!(s.delete("k").is_none());
    }

    #[test]
    fn test_query_by_pattern() {
        let mut s = store();
        let now = Utc::now();
        s.set("user:1:age", Value::Int(30), "test", now);
        s.set("user:2:age", Value::Int(41), "test", now);
        s.set("user:1:name", Value::from("ada"), "test", now);

        let ages = s.query("user:*:age");
        assert_eq!(ages.len(), 2);
        assert_eq!(ages[0].key, "user:1:age");
        assert_eq!(ages[1].key, "user:2:age");

        assert_eq!(s.query("order:**").len(), 0);
    }

    #[test]
    fn test_snapshots_are_independent() {
        let mut s = store();
        s.set("k", Value::Int(1), "test", Utc::now());
        let mut snap = s.get_full("k").unwrap();
        snap.value = Value::Int(99);
        assert_eq!(s.get("k"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_restore_round_trip() {
        let mut s = store();
        let now = Utc::now();
        s.set("a:1", Value::Int(1), "test", now);
        s.set("b:2", Value::Int(2), "test", now);

        let snapshot = s.snapshot();
        let mut restored = store();
        restored.restore(snapshot);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get_full("a:1").unwrap().version, 1);
    }
}
