//! Partitioned temporal state tracking per rule.
//!
//! Every rule with a temporal trigger owns one state machine per distinct
//! `group_by` value. The engine feeds each incoming event to every registered
//! pattern, collects completions, and exposes the earliest absence deadline so
//! the dispatch loop can sleep precisely.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::value::Value;

use super::states::{AbsenceState, CapturedEvent, SequenceState, SequenceStep, WindowState};
use super::TemporalPattern;

/// A temporal pattern that completed for one partition.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Rule whose trigger completed.
    pub rule_id: String,
    /// Partition key (`""` when un-partitioned).
    pub group_key: String,
    /// Captured events, in match order.
    pub captured: Vec<(Option<String>, Event)>,
    /// Aggregate value for aggregate patterns.
    pub aggregate_value: Option<f64>,
    /// Live count for count patterns.
    pub count: Option<u64>,
}

enum Partition {
    Sequence(SequenceState),
    Absence(AbsenceState),
    Window(WindowState),
}

impl Partition {
    fn last_activity(&self) -> DateTime<Utc> {
        match self {
            Self::Sequence(s) => s.last_activity,
            Self::Absence(s) => s.last_activity,
            Self::Window(s) => s.last_activity,
        }
    }
}

struct RuleState {
    pattern: TemporalPattern,
    partitions: BTreeMap<String, Partition>,
}

/// Tracks temporal state for all registered temporal rules.
#[derive(Default)]
pub struct TemporalEngine {
    rules: BTreeMap<String, RuleState>,
}

impl TemporalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the pattern for a rule, clearing prior state.
    pub fn register(&mut self, rule_id: impl Into<String>, pattern: TemporalPattern) {
        self.rules.insert(
            rule_id.into(),
            RuleState {
                pattern,
                partitions: BTreeMap::new(),
            },
        );
    }

    /// Drops a rule and its partitions.
    pub fn unregister(&mut self, rule_id: &str) {
        self.rules.remove(rule_id);
    }

    /// Number of live partitions across all rules.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.rules.values().map(|r| r.partitions.len()).sum()
    }

    /// Feeds an event to every registered pattern, collecting completions.
    pub fn on_event(&mut self, event: &Event) -> Vec<Completion> {
        let mut completions = Vec::new();

        for (rule_id, state) in &mut self.rules {
            let key = state.pattern.partition_key(event);

            match &state.pattern {
                TemporalPattern::Sequence {
                    events,
                    within,
                    strict,
                    ..
                } => {
                    let partition = state
                        .partitions
                        .entry(key.clone())
                        .or_insert_with(|| Partition::Sequence(SequenceState::new(event.timestamp)));
                    let Partition::Sequence(seq) = partition else {
                        continue;
                    };
                    match seq.advance(events, *within, *strict, event) {
                        SequenceStep::Completed(captured) => completions.push(Completion {
                            rule_id: rule_id.clone(),
                            group_key: key,
                            captured: captured
                                .into_iter()
                                .map(|CapturedEvent { alias, event }| (alias, event))
                                .collect(),
                            aggregate_value: None,
                            count: None,
                        }),
                        SequenceStep::Advanced | SequenceStep::Idle => {}
                    }
                }

                TemporalPattern::Absence {
                    after,
                    expected,
                    within,
                    ..
                } => {
                    // Cancellation wins over re-arming within one event.
                    if expected.matches(event) {
                        state.partitions.remove(&key);
                    } else if after.matches(event) && !state.partitions.contains_key(&key) {
                        state
                            .partitions
                            .insert(key, Partition::Absence(AbsenceState::arm(after, event, *within)));
                    }
                }

                TemporalPattern::Count {
                    event: matcher,
                    threshold,
                    comparison,
                    window,
                    sliding,
                    ..
                } => {
                    if !matcher.matches(event) {
                        continue;
                    }
                    let partition = state
                        .partitions
                        .entry(key.clone())
                        .or_insert_with(|| Partition::Window(WindowState::new(event.timestamp)));
                    let Partition::Window(win) = partition else {
                        continue;
                    };
                    let fired = win.record(
                        event.timestamp,
                        1.0,
                        *window,
                        *sliding,
                        *comparison,
                        *threshold as f64,
                        |samples| samples.len() as f64,
                    );
                    if let Some(value) = fired {
                        completions.push(Completion {
                            rule_id: rule_id.clone(),
                            group_key: key,
                            captured: vec![(matcher.alias.clone(), event.clone())],
                            aggregate_value: None,
                            count: Some(value as u64),
                        });
                    }
                }

                TemporalPattern::Aggregate {
                    event: matcher,
                    field,
                    function,
                    threshold,
                    comparison,
                    window,
                    ..
                } => {
                    if !matcher.matches(event) {
                        continue;
                    }
                    let segments: Vec<&str> = field.split('.').collect();
                    let Some(sample) = event
                        .data
                        .get(segments[0])
                        .and_then(|v| v.get_path(&segments[1..]))
                        .and_then(Value::as_f64)
                    else {
                        // Events without a numeric sample are not recorded.
                        continue;
                    };
                    let partition = state
                        .partitions
                        .entry(key.clone())
                        .or_insert_with(|| Partition::Window(WindowState::new(event.timestamp)));
                    let Partition::Window(win) = partition else {
                        continue;
                    };
                    let function = *function;
                    let fired = win.record(
                        event.timestamp,
                        sample,
                        *window,
                        // Aggregate windows slide: stale samples evict individually.
                        true,
                        *comparison,
                        *threshold,
                        move |samples| {
                            let values: Vec<f64> = samples.iter().map(|(_, v)| *v).collect();
                            function.apply(&values)
                        },
                    );
                    if let Some(value) = fired {
                        completions.push(Completion {
                            rule_id: rule_id.clone(),
                            group_key: key,
                            captured: vec![(matcher.alias.clone(), event.clone())],
                            aggregate_value: Some(value),
                            count: None,
                        });
                    }
                }
            }
        }

        completions
    }

    /// Earliest armed absence deadline across all rules.
    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.rules
            .values()
            .flat_map(|r| r.partitions.values())
            .filter_map(|p| match p {
                Partition::Absence(a) => Some(a.deadline),
                _ => None,
            })
            .min()
    }

    /// Fires every absence deadline elapsed at `now`.
    pub fn on_deadline(&mut self, now: DateTime<Utc>) -> Vec<Completion> {
        let mut completions = Vec::new();

        for (rule_id, state) in &mut self.rules {
            if !matches!(state.pattern, TemporalPattern::Absence { .. }) {
                continue;
            }

            let expired: Vec<String> = state
                .partitions
                .iter()
                .filter_map(|(key, p)| match p {
                    Partition::Absence(a) if a.deadline <= now => Some(key.clone()),
                    _ => None,
                })
                .collect();

            for key in expired {
                let Some(Partition::Absence(armed)) = state.partitions.remove(&key) else {
                    continue;
                };
                completions.push(Completion {
                    rule_id: rule_id.clone(),
                    group_key: key,
                    captured: vec![(armed.after_event.alias, armed.after_event.event)],
                    aggregate_value: None,
                    count: None,
                });
            }
        }

        completions
    }

    /// Removes partitions idle beyond `2×window`.
    ///
    /// Armed absence partitions are exempt; their lifetime is the deadline.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        for state in self.rules.values_mut() {
            let horizon = state.pattern.window().as_chrono() * 2;
            state.partitions.retain(|_, p| match p {
                Partition::Absence(_) => true,
                other => now - other.last_activity() <= horizon,
            });
        }
    }
}
