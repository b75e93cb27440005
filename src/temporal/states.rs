//! Per-partition temporal state machines.
//!
//! Each state advances on matching events and reports whether the partition
//! completed. The engine owns partition lifecycle (creation, reset, GC).

use chrono::{DateTime, Utc};

use crate::event::Event;
use crate::time::DurationMs;

use super::{Comparison, EventMatcher};

/// A captured event with its optional alias.
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub alias: Option<String>,
    pub event: Event,
}

/// Sequence cursor state.
#[derive(Debug, Default)]
pub struct SequenceState {
    cursor: usize,
    window_start: Option<DateTime<Utc>>,
    captured: Vec<CapturedEvent>,
    pub last_activity: DateTime<Utc>,
}

/// Outcome of advancing a sequence partition.
#[derive(Debug)]
pub enum SequenceStep {
    /// Nothing changed.
    Idle,
    /// The cursor advanced but the sequence is not complete.
    Advanced,
    /// The full sequence matched; captured events attached.
    Completed(Vec<CapturedEvent>),
}

impl SequenceState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: now,
            ..Self::default()
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.window_start = None;
        self.captured.clear();
    }

    /// Advances the cursor for `event`.
    pub fn advance(
        &mut self,
        matchers: &[EventMatcher],
        within: DurationMs,
        strict: bool,
        event: &Event,
    ) -> SequenceStep {
        self.last_activity = event.timestamp;

        // Expire a window that ran out before this event.
        if let Some(start) = self.window_start {
            if event.timestamp - start > within.as_chrono() {
                self.reset();
            }
        }

        let expected = &matchers[self.cursor.min(matchers.len() - 1)];
        if expected.matches(event) {
            if self.cursor == 0 {
                self.window_start = Some(event.timestamp);
            }
            self.captured.push(CapturedEvent {
                alias: expected.alias.clone(),
                event: event.clone(),
            });
            self.cursor += 1;

            if self.cursor == matchers.len() {
                let captured = std::mem::take(&mut self.captured);
                self.reset();
                return SequenceStep::Completed(captured);
            }
            return SequenceStep::Advanced;
        }

        // Mid-sequence, strict mode resets on events foreign to the pattern.
        if strict
            && self.cursor > 0
            && !matchers.iter().any(|m| m.matches(event))
        {
            self.reset();
        }
        SequenceStep::Idle
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.cursor > 0
    }
}

/// Armed absence deadline.
#[derive(Debug)]
pub struct AbsenceState {
    pub deadline: DateTime<Utc>,
    pub after_event: CapturedEvent,
    pub last_activity: DateTime<Utc>,
}

impl AbsenceState {
    pub fn arm(after: &EventMatcher, event: &Event, within: DurationMs) -> Self {
        Self {
            deadline: event.timestamp + within.as_chrono(),
            after_event: CapturedEvent {
                alias: after.alias.clone(),
                event: event.clone(),
            },
            last_activity: event.timestamp,
        }
    }
}

/// Windowed sample ring shared by count and aggregate patterns.
///
/// Sliding windows evict individual stale samples; tumbling windows clear on
/// boundary. The `satisfied` flag de-bounces contiguous re-satisfactions.
#[derive(Debug, Default)]
pub struct WindowState {
    samples: Vec<(DateTime<Utc>, f64)>,
    window_start: Option<DateTime<Utc>>,
    satisfied: bool,
    pub last_activity: DateTime<Utc>,
}

impl WindowState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_activity: now,
            ..Self::default()
        }
    }

    /// Records a sample and reports whether the threshold comparison newly
    /// became satisfied.
    ///
    /// `measure` maps the live samples to the compared quantity (count or
    /// aggregate value); the caller resolves it against `comparison` and
    /// `threshold`.
    pub fn record(
        &mut self,
        at: DateTime<Utc>,
        sample: f64,
        window: DurationMs,
        sliding: bool,
        comparison: Comparison,
        threshold: f64,
        measure: impl Fn(&[(DateTime<Utc>, f64)]) -> f64,
    ) -> Option<f64> {
        self.last_activity = at;

        if sliding {
            let horizon = at - window.as_chrono();
            self.samples.retain(|(ts, _)| *ts > horizon);
        } else {
            match self.window_start {
                Some(start) if at - start > window.as_chrono() => {
                    self.samples.clear();
                    self.window_start = Some(at);
                    self.satisfied = false;
                }
                None => self.window_start = Some(at),
                _ => {}
            }
        }

        self.samples.push((at, sample));

        let value = measure(&self.samples);
        if comparison.holds(value, threshold) {
            if !self.satisfied {
                self.satisfied = true;
                return Some(value);
            }
            None
        } else {
            self.satisfied = false;
            None
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
