//! Ring-buffered trace collector for rule evaluation.
//!
//! Tracing is off by default; when enabled, every candidate rule evaluation
//! appends one entry. The buffer is bounded and drops the oldest entry on
//! overflow.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a traced rule evaluation ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceOutcome {
    /// Conditions passed and all actions ran.
    Fired,
    /// Conditions evaluated false.
    ConditionsFailed,
    /// The fire was dropped (e.g. a skipped lookup).
    Skipped {
        reason: String,
    },
    /// An action or lookup errored.
    Failed {
        error: String,
    },
}

/// One traced rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub rule_id: String,
    /// Short trigger description (`event order.created`, `timer retry`).
    pub trigger: String,
    pub outcome: TraceOutcome,
    /// Actions completed before the outcome.
    pub actions_executed: usize,
    pub duration_ms: f64,
}

/// Bounded trace ring.
#[derive(Debug)]
pub struct TraceCollector {
    enabled: bool,
    capacity: usize,
    entries: VecDeque<TraceEntry>,
}

impl TraceCollector {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            enabled: false,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Appends an entry when enabled, dropping the oldest on overflow.
    pub fn record(&mut self, entry: TraceEntry) {
        if !self.enabled {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Snapshot of the buffered entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
