//! Temporal pattern detection over windowed event streams.
//!
//! Four detector shapes: sequence, absence, count and aggregate. Each rule
//! with a temporal trigger owns a set of partitions keyed by its `group_by`
//! field value; partitions advance independently and are garbage-collected
//! after `2×window` of inactivity.

mod states;

pub mod engine;

pub use engine::{Completion, TemporalEngine};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::event::Event;
use crate::pattern::topic_matches;
use crate::time::DurationMs;
use crate::value::{Map, Value};

/// Matches events by topic glob and optional payload filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMatcher {
    /// Topic glob (`order.*`).
    pub topic: String,

    /// Payload subset filter: every entry must deep-equal the event field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Map>,

    /// Capture alias exposed to the completion context.
    #[serde(default, rename = "as", skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl EventMatcher {
    #[must_use]
    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            filter: None,
            alias: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Map) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Returns true when the event satisfies topic and filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if !topic_matches(&self.topic, &event.topic) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => filter
                .iter()
                .all(|(k, expected)| event.data.get(k) == Some(expected)),
        }
    }
}

/// Threshold comparison for count and aggregate patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gte,
    Lte,
    Eq,
}

impl Comparison {
    /// Applies the comparison with `lhs` on the left.
    #[must_use]
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gte => lhs >= rhs,
            Self::Lte => lhs <= rhs,
            Self::Eq => lhs == rhs,
        }
    }
}

/// Aggregation function for aggregate patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateFn {
    /// Applies the function to the sampled values.
    #[must_use]
    pub fn apply(self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return match self {
                Self::Count | Self::Sum => 0.0,
                _ => f64::NAN,
            };
        }
        match self {
            Self::Sum => values.iter().sum(),
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Count => values.len() as f64,
        }
    }
}

/// A temporal trigger pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemporalPattern {
    /// Ordered event sequence inside a window.
    Sequence {
        /// Expected events, in order; at least two.
        events: Vec<EventMatcher>,
        /// Window measured from the first matched event.
        within: DurationMs,
        /// Partition field.
        #[serde(default, alias = "groupBy", skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
        /// When true, any unrelated event mid-sequence resets the partition.
        #[serde(default)]
        strict: bool,
    },

    /// An expected event failing to arrive after a starting event.
    Absence {
        /// Event arming the deadline.
        after: EventMatcher,
        /// Event cancelling the deadline.
        expected: EventMatcher,
        /// Deadline measured from the arming event.
        within: DurationMs,
        /// Partition field.
        #[serde(default, alias = "groupBy", skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
    },

    /// Event count inside a window crossing a threshold.
    Count {
        /// Counted event.
        event: EventMatcher,
        /// Threshold the count is compared against.
        threshold: u64,
        /// Comparison direction.
        #[serde(default = "default_comparison")]
        comparison: Comparison,
        /// Window size.
        window: DurationMs,
        /// Partition field.
        #[serde(default, alias = "groupBy", skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
        /// Sliding window when true, tumbling otherwise.
        #[serde(default)]
        sliding: bool,
    },

    /// Numeric aggregate over a window crossing a threshold.
    Aggregate {
        /// Sampled event.
        event: EventMatcher,
        /// Dot-path into the event payload yielding the sampled number.
        field: String,
        /// Aggregation function.
        function: AggregateFn,
        /// Threshold the aggregate is compared against.
        threshold: f64,
        /// Comparison direction.
        #[serde(default = "default_comparison")]
        comparison: Comparison,
        /// Window size.
        window: DurationMs,
        /// Partition field.
        #[serde(default, alias = "groupBy", skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
    },
}

const fn default_comparison() -> Comparison {
    Comparison::Gte
}

impl TemporalPattern {
    /// Validates structural constraints.
    ///
    /// # Errors
    ///
    /// Rejects sequences of fewer than two events and zero-width windows.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidTemporalPattern {
            reason: reason.to_string(),
        };

        match self {
            Self::Sequence { events, within, .. } => {
                if events.len() < 2 {
                    return Err(invalid("sequence requires at least two events"));
                }
                if within.as_millis() == 0 {
                    return Err(invalid("sequence window must be positive"));
                }
            }
            Self::Absence { within, .. } => {
                if within.as_millis() == 0 {
                    return Err(invalid("absence deadline must be positive"));
                }
            }
            Self::Count { window, .. } | Self::Aggregate { window, .. } => {
                if window.as_millis() == 0 {
                    return Err(invalid("window must be positive"));
                }
            }
        }
        Ok(())
    }

    /// Partition field name, if any.
    #[must_use]
    pub fn group_by(&self) -> Option<&str> {
        match self {
            Self::Sequence { group_by, .. }
            | Self::Absence { group_by, .. }
            | Self::Count { group_by, .. }
            | Self::Aggregate { group_by, .. } => group_by.as_deref(),
        }
    }

    /// Window (or deadline) size.
    #[must_use]
    pub fn window(&self) -> DurationMs {
        match self {
            Self::Sequence { within, .. } | Self::Absence { within, .. } => *within,
            Self::Count { window, .. } | Self::Aggregate { window, .. } => *window,
        }
    }

    /// Derives the partition key for an event (`""` when un-partitioned).
    #[must_use]
    pub fn partition_key(&self, event: &Event) -> String {
        match self.group_by() {
            None => String::new(),
            Some(field) => event
                .data
                .get(field)
                .map(Value::coerce_string)
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(topic: &str, data: &[(&str, Value)]) -> Event {
        let mut map = Map::new();
        for (k, v) in data {
            map.insert((*k).to_string(), v.clone());
        }
        Event::new(topic, map, Utc::now(), "test")
    }

    #[test]
    fn test_matcher_topic_glob() {
        let m = EventMatcher::topic("order.*");
        assert!(m.matches(&event("order.created", &[])));
        assert!(!m.matches(&event("payment.received", &[])));
    }

    #[test]
    fn test_matcher_filter_subset() {
        let mut filter = Map::new();
        filter.insert("status".to_string(), Value::from("gold"));
        let m = EventMatcher::topic("user.upgraded").with_filter(filter);

        assert!(m.matches(&event("user.upgraded", &[("status", Value::from("gold"))])));
        assert!(!m.matches(&event("user.upgraded", &[("status", Value::from("silver"))])));
        assert!(!m.matches(&event("user.upgraded", &[])));
    }

    #[test]
    fn test_comparison() {
        assert!(Comparison::Gte.holds(3.0, 3.0));
        assert!(Comparison::Lte.holds(2.0, 3.0));
        assert!(Comparison::Eq.holds(3.0, 3.0));
        assert!(!Comparison::Eq.holds(3.0, 4.0));
    }

    #[test]
    fn test_aggregate_fns() {
        let values = [2.0, 4.0, 6.0];
        assert_eq!(AggregateFn::Sum.apply(&values), 12.0);
        assert_eq!(AggregateFn::Avg.apply(&values), 4.0);
        assert_eq!(AggregateFn::Min.apply(&values), 2.0);
        assert_eq!(AggregateFn::Max.apply(&values), 6.0);
        assert_eq!(AggregateFn::Count.apply(&values), 3.0);
        assert_eq!(AggregateFn::Sum.apply(&[]), 0.0);
    }

    #[test]
    fn test_validate_rejects_short_sequence() {
        let pattern = TemporalPattern::Sequence {
            events: vec![EventMatcher::topic("a")],
            within: DurationMs::from_secs(60),
            group_by: None,
            strict: false,
        };
        assert!(pattern.validate().is_err());
    }

    #[test]
    fn test_partition_key() {
        let pattern = TemporalPattern::Count {
            event: EventMatcher::topic("auth.login_failed"),
            threshold: 3,
            comparison: Comparison::Gte,
            window: DurationMs::from_secs(60),
            group_by: Some("userId".to_string()),
            sliding: true,
        };
        assert_eq!(
            pattern.partition_key(&event("auth.login_failed", &[("userId", Value::from("u1"))])),
            "u1"
        );
        assert_eq!(pattern.partition_key(&event("auth.login_failed", &[])), "");
    }

    #[test]
    fn test_group_by_alias_accepted_in_yaml() {
        let yaml = r#"
type: count
event:
  topic: auth.login_failed
threshold: 3
window: 1m
groupBy: userId
sliding: true
"#;
        let pattern: TemporalPattern = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pattern.group_by(), Some("userId"));
        assert_eq!(pattern.window().as_millis(), 60_000);
    }
}
