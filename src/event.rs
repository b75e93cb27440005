//! Event types flowing through the bus and the dispatcher.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::Map;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event published on the bus.
///
/// `source` identifies the producer (`"api"`, `"rule:<id>"`, `"timer"`,
/// `"temporal"`, `"engine"`). `causation_id` typically equals the id of the
/// event whose processing emitted this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique id.
    pub id: EventId,
    /// Dot-delimited topic (`order.created`).
    pub topic: String,
    /// Structured payload.
    pub data: Map,
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Producer identity.
    pub source: String,

    /// Correlation id threading a causal chain of events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Id of the event that caused this emission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
}

impl Event {
    /// Creates an event with a fresh id.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        data: Map,
        timestamp: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: EventId::new(),
            topic: topic.into(),
            data,
            timestamp,
            source: source.into(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Attaches correlation metadata.
    #[must_use]
    pub fn correlated(mut self, correlation_id: impl Into<String>, causation_id: Option<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self.causation_id = causation_id;
        self
    }
}

/// Topics of events the engine emits internally for observers.
///
/// Each internal event carries a `category` field used by the audit log.
pub mod topics {
    pub const FACT_CREATED: &str = "fact_created";
    pub const FACT_UPDATED: &str = "fact_updated";
    pub const FACT_DELETED: &str = "fact_deleted";

    pub const RULE_REGISTERED: &str = "rule_registered";
    pub const RULE_UPDATED: &str = "rule_updated";
    pub const RULE_ENABLED: &str = "rule_enabled";
    pub const RULE_DISABLED: &str = "rule_disabled";
    pub const RULE_UNREGISTERED: &str = "rule_unregistered";
    pub const RULE_FIRED: &str = "rule_fired";
    pub const RULE_FAILED: &str = "rule_failed";

    pub const TIMER_SET: &str = "timer_set";
    pub const TIMER_FIRED: &str = "timer_fired";
    pub const TIMER_CANCELLED: &str = "timer_cancelled";

    pub const ENGINE_STARTED: &str = "engine_started";
    pub const ENGINE_STOPPED: &str = "engine_stopped";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn test_correlated_event() {
        let ev = Event::new("order.created", Map::new(), Utc::now(), "api")
            .correlated("corr-1", Some("cause-1".to_string()));
        assert_eq!(ev.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(ev.causation_id.as_deref(), Some("cause-1"));
    }

    #[test]
    fn test_event_serialization_round_trip() {
        let mut data = Map::new();
        data.insert("amount".to_string(), crate::Value::Int(150));
        let ev = Event::new("order.created", data, Utc::now(), "api");

        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }
}
