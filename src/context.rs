//! The per-fire evaluation context and reference resolution.
//!
//! References are dot-notated paths against the context roots, in priority
//! order: `event.*` (or a temporal capture alias such as `order.*`),
//! `fact.*` (colon keys allowed, `fact.user:123:age`), `lookups.<name>.*`,
//! `context.*` and, for temporal completions, `events.*` and
//! `aggregate.value`. Missing paths resolve to nothing; operators treat that
//! as "not exists".

use crate::event::Event;
use crate::fact::FactStore;
use crate::value::{contains_template, Map, Value};

/// Evaluation context for one rule fire.
pub struct EvalContext<'a> {
    event: Option<&'a Event>,
    facts: &'a FactStore,
    lookups: &'a Map,
    scratch: &'a Map,
    /// Temporal capture aliases and indices (`events.<as>` / `events[i]`).
    events_root: Option<&'a Map>,
    /// Aggregate value for aggregate completions.
    aggregate: Option<f64>,
}

impl<'a> EvalContext<'a> {
    /// Builds a context over the trigger event and fact store.
    #[must_use]
    pub fn new(
        event: Option<&'a Event>,
        facts: &'a FactStore,
        lookups: &'a Map,
        scratch: &'a Map,
    ) -> Self {
        Self {
            event,
            facts,
            lookups,
            scratch,
            events_root: None,
            aggregate: None,
        }
    }

    /// Exposes temporal captures under `events.*` and as top-level aliases.
    #[must_use]
    pub fn with_captures(mut self, events_root: &'a Map) -> Self {
        self.events_root = Some(events_root);
        self
    }

    /// Exposes `aggregate.value`.
    #[must_use]
    pub fn with_aggregate(mut self, value: f64) -> Self {
        self.aggregate = Some(value);
        self
    }

    /// The trigger event, if any.
    #[must_use]
    pub const fn event(&self) -> Option<&'a Event> {
        self.event
    }

    /// The fact store backing `fact.*` paths.
    #[must_use]
    pub const fn facts(&self) -> &'a FactStore {
        self.facts
    }

    /// Resolves a dot-notated path. `None` means undefined.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let (&root, rest) = segments.split_first()?;

        match root {
            "event" => self.resolve_event(rest),
            "fact" => self.resolve_fact(rest),
            "lookups" => {
                let (&name, rest) = rest.split_first()?;
                self.lookups.get(name)?.get_path(rest).cloned()
            }
            "context" => {
                let (&key, rest) = rest.split_first()?;
                self.scratch.get(key)?.get_path(rest).cloned()
            }
            "events" => {
                let (&key, rest) = rest.split_first()?;
                self.events_root?.get(key)?.get_path(rest).cloned()
            }
            "aggregate" => match rest {
                ["value"] => self.aggregate.map(Value::Float),
                _ => None,
            },
            // A temporal capture alias acts as a root of its own.
            alias => self.events_root?.get(alias)?.get_path(rest).cloned(),
        }
    }

    fn resolve_event(&self, rest: &[&str]) -> Option<Value> {
        let event = self.event?;
        if rest.is_empty() {
            return Some(Value::Object(event.data.clone()));
        }

        // Payload fields shadow event metadata.
        let (&first, tail) = rest.split_first()?;
        if let Some(field) = event.data.get(first) {
            return field.get_path(tail).cloned();
        }

        match rest {
            ["topic"] => Some(Value::from(event.topic.clone())),
            ["id"] => Some(Value::from(event.id.to_string())),
            ["source"] => Some(Value::from(event.source.clone())),
            ["timestamp"] => Some(Value::from(event.timestamp.to_rfc3339())),
            ["correlation_id"] => event.correlation_id.clone().map(Value::from),
            ["causation_id"] => event.causation_id.clone().map(Value::from),
            _ => None,
        }
    }

    fn resolve_fact(&self, rest: &[&str]) -> Option<Value> {
        let (&key, rest) = rest.split_first()?;
        self.facts.get(key)?.get_path(rest).cloned()
    }

    /// Recursively resolves references and interpolation tokens.
    ///
    /// Unresolvable references become `Null`; unresolvable interpolation
    /// tokens render as the empty string.
    #[must_use]
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::Ref { path } => self.resolve_path(path).unwrap_or(Value::Null),
            Value::String(s) if contains_template(s) => Value::String(self.interpolate(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolves every value of a map.
    #[must_use]
    pub fn resolve_map(&self, map: &Map) -> Map {
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve_value(v)))
            .collect()
    }

    /// Substring interpolation: each `${path}` token is replaced with the
    /// resolved value's string form.
    #[must_use]
    pub fn interpolate(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let path = &after[..end];
                    if let Some(value) = self.resolve_path(path) {
                        out.push_str(&value.coerce_string());
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated token: emit verbatim.
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fixture() -> (Event, FactStore, Map, Map) {
        let mut data = Map::new();
        data.insert("amount".to_string(), Value::Int(150));
        let mut nested = Map::new();
        nested.insert("id".to_string(), Value::from("c-9"));
        data.insert("customer".to_string(), Value::Object(nested));
        let event = Event::new("order.created", data, Utc::now(), "api");

        let mut facts = FactStore::new();
        facts.set("user:123:age", Value::Int(30), "test", Utc::now());

        let mut lookups = Map::new();
        lookups.insert("user".to_string(), Value::from("ada"));

        let mut scratch = Map::new();
        scratch.insert("rule_id".to_string(), Value::from("r1"));

        (event, facts, lookups, scratch)
    }

    #[test]
    fn test_event_paths() {
        let (event, facts, lookups, scratch) = fixture();
        let ctx = EvalContext::new(Some(&event), &facts, &lookups, &scratch);

        assert_eq!(ctx.resolve_path("event.amount"), Some(Value::Int(150)));
        assert_eq!(
            ctx.resolve_path("event.customer.id"),
            Some(Value::from("c-9"))
        );
        assert_eq!(
            ctx.resolve_path("event.topic"),
            Some(Value::from("order.created"))
        );
        assert_eq!(ctx.resolve_path("event.missing"), None);
    }

    #[test]
    fn test_fact_paths_with_colon_keys() {
        let (event, facts, lookups, scratch) = fixture();
        let ctx = EvalContext::new(Some(&event), &facts, &lookups, &scratch);

        assert_eq!(ctx.resolve_path("fact.user:123:age"), Some(Value::Int(30)));
        assert_eq!(ctx.resolve_path("fact.user:999:age"), None);
    }

    #[test]
    fn test_lookup_and_context_paths() {
        let (event, facts, lookups, scratch) = fixture();
        let ctx = EvalContext::new(Some(&event), &facts, &lookups, &scratch);

        assert_eq!(ctx.resolve_path("lookups.user"), Some(Value::from("ada")));
        assert_eq!(ctx.resolve_path("context.rule_id"), Some(Value::from("r1")));
        assert_eq!(ctx.resolve_path("lookups.none"), None);
    }

    #[test]
    fn test_alias_and_events_roots() {
        let (event, facts, lookups, scratch) = fixture();
        let mut order_data = Map::new();
        order_data.insert("amount".to_string(), Value::Int(42));
        let mut captures = Map::new();
        captures.insert("order".to_string(), Value::Object(order_data));

        let ctx = EvalContext::new(Some(&event), &facts, &lookups, &scratch)
            .with_captures(&captures)
            .with_aggregate(12.5);

        assert_eq!(ctx.resolve_path("order.amount"), Some(Value::Int(42)));
        assert_eq!(ctx.resolve_path("events.order.amount"), Some(Value::Int(42)));
        assert_eq!(ctx.resolve_path("aggregate.value"), Some(Value::Float(12.5)));
        assert_eq!(ctx.resolve_path("aggregate.other"), None);
    }

    #[test]
    fn test_resolve_value_refs_and_templates() {
        let (event, facts, lookups, scratch) = fixture();
        let ctx = EvalContext::new(Some(&event), &facts, &lookups, &scratch);

        assert_eq!(
            ctx.resolve_value(&Value::reference("event.amount")),
            Value::Int(150)
        );
        assert_eq!(ctx.resolve_value(&Value::reference("nowhere.at.all")), Value::Null);

        let templated = Value::from("order:${event.customer.id}:total");
        assert_eq!(ctx.resolve_value(&templated), Value::from("order:c-9:total"));
    }

    #[test]
    fn test_resolve_value_recurses() {
        let (event, facts, lookups, scratch) = fixture();
        let ctx = EvalContext::new(Some(&event), &facts, &lookups, &scratch);

        let mut map = Map::new();
        map.insert("total".to_string(), Value::reference("event.amount"));
        map.insert(
            "items".to_string(),
            Value::Array(vec![Value::reference("fact.user:123:age")]),
        );
        let resolved = ctx.resolve_value(&Value::Object(map));

        let obj = resolved.as_object().unwrap();
        assert_eq!(obj["total"], Value::Int(150));
        assert_eq!(obj["items"], Value::Array(vec![Value::Int(30)]));
    }

    #[test]
    fn test_interpolation_edge_cases() {
        let (event, facts, lookups, scratch) = fixture();
        let ctx = EvalContext::new(Some(&event), &facts, &lookups, &scratch);

        // Missing paths render empty.
        assert_eq!(ctx.interpolate("x=${nope}!"), "x=!");
        // Unterminated tokens pass through.
        assert_eq!(ctx.interpolate("broken ${event.amount"), "broken ${event.amount");
        // Multiple tokens.
        assert_eq!(
            ctx.interpolate("${event.amount}-${lookups.user}"),
            "150-ada"
        );
    }
}
