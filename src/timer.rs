//! Timer scheduling: one-shot, interval-repeat and cron timers.
//!
//! The wheel keeps a min-heap keyed by deadline; the dispatch loop sleeps
//! until the earliest deadline and drains due timers into synthetic
//! timer-fired triggers. Setting a timer with an existing name replaces its
//! predecessor.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::time::DurationMs;
use crate::value::Map;

/// What to emit when a timer fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnExpire {
    /// Topic of the emitted event.
    pub topic: String,
    /// Event payload. Resolved at `set_timer` time when set from an action.
    #[serde(default)]
    pub data: Map,
}

/// When a timer fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerSchedule {
    /// Fire once after a delay.
    Once {
        /// Delay before firing.
        duration: DurationMs,
    },

    /// Fire repeatedly on a fixed interval.
    Repeat {
        /// Interval between fires (also the initial delay).
        interval: DurationMs,
        /// Stop after this many fires.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_count: Option<u32>,
    },

    /// Fire on a cron schedule.
    Cron {
        /// Cron expression (`cron` crate syntax).
        expr: String,
    },
}

/// Timer configuration supplied by callers and `set_timer` actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Timer name; setting the same name replaces the previous timer.
    pub name: String,
    /// Emission on expiry.
    pub on_expire: OnExpire,
    /// Firing schedule.
    pub schedule: TimerSchedule,
}

impl TimerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Rejects empty names, empty topics, zero durations and malformed cron
    /// expressions.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "timer.name".to_string(),
            });
        }
        if self.on_expire.topic.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "timer.on_expire.topic".to_string(),
            });
        }
        match &self.schedule {
            TimerSchedule::Once { duration } if duration.as_millis() == 0 => {
                Err(ValidationError::InvalidField {
                    field: "timer.schedule.duration".to_string(),
                    reason: "must be positive".to_string(),
                })
            }
            TimerSchedule::Repeat { interval, .. } if interval.as_millis() == 0 => {
                Err(ValidationError::InvalidField {
                    field: "timer.schedule.interval".to_string(),
                    reason: "must be positive".to_string(),
                })
            }
            TimerSchedule::Cron { expr } => cron::Schedule::from_str(expr)
                .map(|_| ())
                .map_err(|e| ValidationError::InvalidCron {
                    expr: expr.clone(),
                    reason: e.to_string(),
                }),
            _ => Ok(()),
        }
    }
}

/// A scheduled timer as exposed through the engine API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    /// Internal id, fresh on every (re)set.
    pub id: Uuid,
    /// Timer name.
    pub name: String,
    /// Next deadline.
    pub expires_at: DateTime<Utc>,
    /// Emission on expiry.
    pub on_expire: OnExpire,
    /// Firing schedule.
    pub schedule: TimerSchedule,
    /// How many times the timer has fired so far.
    pub fired_count: u32,
}

/// A timer expiry popped from the wheel.
#[derive(Debug, Clone)]
pub struct FiredTimer {
    /// Timer name.
    pub name: String,
    /// Emission config.
    pub on_expire: OnExpire,
    /// Fire ordinal, starting at 1.
    pub fired_count: u32,
    /// The deadline that elapsed.
    pub deadline: DateTime<Utc>,
}

struct ActiveTimer {
    timer: Timer,
    /// Heap entries with a stale seq are skipped on pop.
    seq: u64,
}

/// Min-heap timer wheel.
#[derive(Default)]
pub struct TimerWheel {
    timers: HashMap<String, ActiveTimer>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    next_seq: u64,
}

impl TimerWheel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn first_deadline(
        schedule: &TimerSchedule,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationError> {
        match schedule {
            TimerSchedule::Once { duration } => Ok(now + duration.as_chrono()),
            TimerSchedule::Repeat { interval, .. } => Ok(now + interval.as_chrono()),
            TimerSchedule::Cron { expr } => {
                let schedule =
                    cron::Schedule::from_str(expr).map_err(|e| ValidationError::InvalidCron {
                        expr: expr.clone(),
                        reason: e.to_string(),
                    })?;
                schedule
                    .after(&now)
                    .next()
                    .ok_or_else(|| ValidationError::InvalidCron {
                        expr: expr.clone(),
                        reason: "schedule yields no future fire time".to_string(),
                    })
            }
        }
    }

    /// Arms (or replaces) a timer. Returns the scheduled snapshot.
    ///
    /// # Errors
    ///
    /// Propagates configuration validation failures.
    pub fn set(&mut self, config: TimerConfig, now: DateTime<Utc>) -> Result<Timer, ValidationError> {
        config.validate()?;
        let expires_at = Self::first_deadline(&config.schedule, now)?;

        let seq = self.next_seq;
        self.next_seq += 1;

        let timer = Timer {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            expires_at,
            on_expire: config.on_expire,
            schedule: config.schedule,
            fired_count: 0,
        };

        self.heap
            .push(Reverse((expires_at, seq, config.name.clone())));
        self.timers.insert(
            config.name,
            ActiveTimer {
                timer: timer.clone(),
                seq,
            },
        );
        Ok(timer)
    }

    /// Cancels a timer by name. Returns whether one existed.
    pub fn cancel(&mut self, name: &str) -> bool {
        self.timers.remove(name).is_some()
    }

    /// Earliest live deadline, if any.
    #[must_use]
    pub fn next_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((deadline, seq, name))) = self.heap.peek().cloned() {
            match self.timers.get(&name) {
                Some(active) if active.seq == seq => return Some(deadline),
                _ => {
                    // Stale entry from a replaced or cancelled timer.
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pops every timer due at `now`, rescheduling repeating ones.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<FiredTimer> {
        let mut fired = Vec::new();

        loop {
            match self.next_deadline() {
                Some(deadline) if deadline <= now => {}
                _ => break,
            }

            let Some(Reverse((deadline, _seq, name))) = self.heap.pop() else {
                break;
            };
            let Some(active) = self.timers.get_mut(&name) else {
                continue;
            };

            active.timer.fired_count += 1;
            fired.push(FiredTimer {
                name: name.clone(),
                on_expire: active.timer.on_expire.clone(),
                fired_count: active.timer.fired_count,
                deadline,
            });

            let next = match &active.timer.schedule {
                TimerSchedule::Once { .. } => None,
                TimerSchedule::Repeat { interval, max_count } => {
                    let exhausted = max_count.is_some_and(|max| active.timer.fired_count >= max);
                    (!exhausted).then(|| now + interval.as_chrono())
                }
                TimerSchedule::Cron { expr } => cron::Schedule::from_str(expr)
                    .ok()
                    .and_then(|s| s.after(&now).next()),
            };

            match next {
                Some(next_deadline) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    active.seq = seq;
                    active.timer.expires_at = next_deadline;
                    self.heap.push(Reverse((next_deadline, seq, name)));
                }
                None => {
                    self.timers.remove(&name);
                }
            }
        }

        fired
    }

    /// Snapshots of all live timers, ordered by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Timer> {
        let mut out: Vec<Timer> = self.timers.values().map(|a| a.timer.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Drops every timer.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.heap.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
