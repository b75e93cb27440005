//! Engine-wide and per-rule execution counters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters for a single rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounters {
    /// Completed fires.
    pub executions: u64,
    /// Fires aborted by an error.
    pub failures: u64,
    /// Fires dropped by a skipped lookup.
    pub skipped: u64,
}

/// Mutable counter state owned by the dispatch loop.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub events_processed: u64,
    pub triggers_dispatched: u64,
    pub rules_executed: u64,
    pub rules_failed: u64,
    pub rules_skipped: u64,
    pub actions_executed: u64,
    pub timers_fired: u64,
    pub temporal_completions: u64,
    pub dropped_triggers: u64,
    pub handler_errors: u64,
    processing_micros: u64,
    per_rule: BTreeMap<String, RuleCounters>,
}

impl EngineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one trigger's processing time.
    pub fn record_processing(&mut self, micros: u64) {
        self.triggers_dispatched += 1;
        self.processing_micros = self.processing_micros.saturating_add(micros);
    }

    pub fn rule(&mut self, rule_id: &str) -> &mut RuleCounters {
        self.per_rule.entry(rule_id.to_string()).or_default()
    }

    /// Immutable snapshot for the API.
    #[must_use]
    pub fn snapshot(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> StatsSnapshot {
        let avg_processing_time_ms = if self.triggers_dispatched == 0 {
            0.0
        } else {
            (self.processing_micros as f64 / self.triggers_dispatched as f64) / 1000.0
        };

        StatsSnapshot {
            started_at,
            uptime_ms: (now - started_at).num_milliseconds().max(0) as u64,
            events_processed: self.events_processed,
            triggers_dispatched: self.triggers_dispatched,
            rules_executed: self.rules_executed,
            rules_failed: self.rules_failed,
            rules_skipped: self.rules_skipped,
            actions_executed: self.actions_executed,
            timers_fired: self.timers_fired,
            temporal_completions: self.temporal_completions,
            dropped_triggers: self.dropped_triggers,
            handler_errors: self.handler_errors,
            avg_processing_time_ms,
            per_rule: self.per_rule.clone(),
        }
    }
}

/// Point-in-time statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_ms: u64,
    pub events_processed: u64,
    pub triggers_dispatched: u64,
    pub rules_executed: u64,
    pub rules_failed: u64,
    pub rules_skipped: u64,
    pub actions_executed: u64,
    pub timers_fired: u64,
    pub temporal_completions: u64,
    pub dropped_triggers: u64,
    pub handler_errors: u64,
    pub avg_processing_time_ms: f64,
    pub per_rule: BTreeMap<String, RuleCounters>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_processing_time() {
        let mut stats = EngineStats::new();
        stats.record_processing(1_000);
        stats.record_processing(3_000);

        let now = Utc::now();
        let snap = stats.snapshot(now, now);
        assert_eq!(snap.triggers_dispatched, 2);
        assert!((snap.avg_processing_time_ms - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_per_rule_counters() {
        let mut stats = EngineStats::new();
        stats.rule("r1").executions += 1;
        stats.rule("r1").executions += 1;
        stats.rule("r2").failures += 1;

        let snap = stats.snapshot(Utc::now(), Utc::now());
        assert_eq!(snap.per_rule["r1"].executions, 2);
        assert_eq!(snap.per_rule["r2"].failures, 1);
    }

    #[test]
    fn test_empty_snapshot_has_zero_average() {
        let stats = EngineStats::new();
        let snap = stats.snapshot(Utc::now(), Utc::now());
        assert_eq!(snap.avg_processing_time_ms, 0.0);
    }
}
