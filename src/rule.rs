//! Rule, rule group, trigger, condition, action and lookup types.
//!
//! Rules are the unit of behavior: a trigger selects them, conditions gate
//! them, actions run in declaration order. All shapes are serde-tagged so the
//! YAML authoring surface and canonical JSON share one representation.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::temporal::TemporalPattern;
use crate::time::DurationMs;
use crate::timer::TimerConfig;
use crate::value::{Map, Value};

/// What causes a rule to be considered for firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// An event whose topic matches the glob.
    Event {
        /// Topic glob (`order.*`).
        topic: String,
    },

    /// A fact change whose key matches the glob.
    Fact {
        /// Fact-key glob (`user:*:age`).
        pattern: String,
    },

    /// A timer fire whose name matches the glob.
    Timer {
        /// Timer-name glob.
        name: String,
    },

    /// A temporal pattern completion.
    Temporal {
        /// The detector.
        pattern: TemporalPattern,
    },
}

/// Where a condition reads its left-hand value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSource {
    /// A field of the trigger event payload (dot path).
    Event {
        /// Dot path into the payload.
        field: String,
    },

    /// Facts matching a key glob; multi-match uses any-match semantics.
    Fact {
        /// Fact-key glob.
        pattern: String,
    },

    /// A key of the per-fire scratch context.
    Context {
        /// Context key.
        key: String,
    },

    /// A lookup result, optionally descending into a field.
    Lookup {
        /// Rule-local lookup name.
        name: String,
        /// Optional dot path into the result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

/// Condition comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
    Matches,
    Exists,
    NotExists,
}

impl Operator {
    /// Unary operators ignore the condition value.
    #[must_use]
    pub const fn is_unary(self) -> bool {
        matches!(self, Self::Exists | Self::NotExists)
    }
}

/// A single boolean check; conditions AND together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Left-hand source.
    pub source: ConditionSource,
    /// Comparison operator.
    pub operator: Operator,
    /// Right-hand value; may embed references. Unary operators force `true`.
    #[serde(default = "default_condition_value")]
    pub value: Value,
}

fn default_condition_value() -> Value {
    Value::Bool(true)
}

impl Condition {
    #[must_use]
    pub fn new(source: ConditionSource, operator: Operator, value: Value) -> Self {
        let value = if operator.is_unary() {
            Value::Bool(true)
        } else {
            value
        };
        Self {
            source,
            operator,
            value,
        }
    }
}

/// Severity for `log` actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// An action executed when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Write a fact. The key itself may contain interpolation tokens.
    SetFact {
        key: String,
        value: Value,
    },

    /// Delete a fact.
    DeleteFact {
        key: String,
    },

    /// Emit an event; `data` is fully resolved before emission.
    EmitEvent {
        topic: String,
        #[serde(default)]
        data: Map,
    },

    /// Arm (or replace) a timer.
    SetTimer {
        timer: TimerConfig,
    },

    /// Cancel a timer by name.
    CancelTimer {
        name: String,
    },

    /// Invoke an external service method.
    CallService {
        service: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Emit a diagnostic line; the message may embed interpolation tokens.
    Log {
        level: LogLevel,
        message: String,
    },

    /// Branch on conditions (AND), recursively containing actions.
    Conditional {
        conditions: Vec<Condition>,
        then: Vec<Action>,
        #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
        otherwise: Option<Vec<Action>>,
    },
}

impl Action {
    /// Action kind name used in errors and traces.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SetFact { .. } => "set_fact",
            Self::DeleteFact { .. } => "delete_fact",
            Self::EmitEvent { .. } => "emit_event",
            Self::SetTimer { .. } => "set_timer",
            Self::CancelTimer { .. } => "cancel_timer",
            Self::CallService { .. } => "call_service",
            Self::Log { .. } => "log",
            Self::Conditional { .. } => "conditional",
        }
    }
}

/// Failure policy for a data lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Drop the rule fire, leaving the lookup absent.
    #[default]
    Skip,
    /// Propagate a data-resolution error.
    Fail,
}

/// Cache policy for a data lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSpec {
    /// Time-to-live for cached results.
    pub ttl: DurationMs,
}

/// An external data requirement resolved before condition evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    /// Rule-local unique name; results appear under `lookups.<name>`.
    pub name: String,
    /// Service name in the registry.
    pub service: String,
    /// Method invoked on the service.
    pub method: String,
    /// Arguments; may embed references, resolved per fire.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Optional TTL cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSpec>,
    /// Failure policy.
    #[serde(default)]
    pub on_error: OnError,
}

/// A gating group of rules.
///
/// Deleting a group ungates its rules; rules holding a stale group reference
/// are treated as ungrouped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl RuleGroup {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            enabled: true,
            created_at: Utc::now(),
        }
    }
}

/// A registered rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Unique id.
    pub id: String,
    /// Human-readable name.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Higher priorities dispatch first. Must be finite.
    #[serde(default)]
    pub priority: f64,

    /// Disabled rules never fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Gating group reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    pub trigger: Trigger,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// At least one action.
    pub actions: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lookups: Vec<Lookup>,

    /// Monotonic version, starting at 1 on registration.
    #[serde(default = "default_version")]
    pub version: u64,

    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "epoch")]
    pub updated_at: DateTime<Utc>,
}

const fn default_enabled() -> bool {
    true
}

const fn default_version() -> u64 {
    1
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}

impl Rule {
    /// Starts a fluent builder.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> RuleBuilder {
        RuleBuilder::new(id)
    }

    /// Validates structural constraints.
    ///
    /// # Errors
    ///
    /// Rejects empty ids/names, rules without actions, non-finite priorities,
    /// duplicate lookup names, malformed temporal patterns and malformed
    /// embedded timer configs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyRuleId);
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "name".to_string(),
            });
        }
        if self.actions.is_empty() {
            return Err(ValidationError::NoActions {
                rule_id: self.id.clone(),
            });
        }
        if !self.priority.is_finite() {
            return Err(ValidationError::NonFinitePriority {
                rule_id: self.id.clone(),
                priority: self.priority,
            });
        }

        if let Trigger::Temporal { pattern } = &self.trigger {
            pattern.validate()?;
        }

        for (i, lookup) in self.lookups.iter().enumerate() {
            if lookup.name.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: format!("lookups[{i}].name"),
                });
            }
            if self.lookups[..i].iter().any(|l| l.name == lookup.name) {
                return Err(ValidationError::InvalidField {
                    field: format!("lookups[{i}].name"),
                    reason: format!("duplicate lookup name '{}'", lookup.name),
                });
            }
        }

        validate_actions(&self.actions)?;
        Ok(())
    }
}

fn validate_actions(actions: &[Action]) -> Result<(), ValidationError> {
    for action in actions {
        match action {
            Action::SetTimer { timer } => timer.validate()?,
            Action::Conditional {
                then, otherwise, ..
            } => {
                validate_actions(then)?;
                if let Some(actions) = otherwise {
                    validate_actions(actions)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Fluent builder for [`Rule`].
///
/// # Example
/// ```
/// use verdict::{Action, Condition, ConditionSource, Operator, Rule, Value};
///
/// let rule = Rule::builder("premium-orders")
///     .name("Flag premium orders")
///     .priority(10.0)
///     .on_event("order.created")
///     .condition(Condition::new(
///         ConditionSource::Event { field: "amount".into() },
///         Operator::Gte,
///         Value::Int(100),
///     ))
///     .action(Action::EmitEvent { topic: "order.premium".into(), data: Default::default() })
///     .build()
///     .unwrap();
/// assert_eq!(rule.version, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuleBuilder {
    id: String,
    name: Option<String>,
    description: Option<String>,
    priority: f64,
    enabled: bool,
    tags: Vec<String>,
    group: Option<String>,
    trigger: Option<Trigger>,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
    lookups: Vec<Lookup>,
}

impl RuleBuilder {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the trigger explicitly.
    #[must_use]
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Triggers on an event topic glob.
    #[must_use]
    pub fn on_event(self, topic: impl Into<String>) -> Self {
        self.trigger(Trigger::Event {
            topic: topic.into(),
        })
    }

    /// Triggers on a fact-key glob.
    #[must_use]
    pub fn on_fact(self, pattern: impl Into<String>) -> Self {
        self.trigger(Trigger::Fact {
            pattern: pattern.into(),
        })
    }

    /// Triggers on a timer-name glob.
    #[must_use]
    pub fn on_timer(self, name: impl Into<String>) -> Self {
        self.trigger(Trigger::Timer { name: name.into() })
    }

    /// Triggers on a temporal pattern completion.
    #[must_use]
    pub fn on_temporal(self, pattern: TemporalPattern) -> Self {
        self.trigger(Trigger::Temporal { pattern })
    }

    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    #[must_use]
    pub fn lookup(mut self, lookup: Lookup) -> Self {
        self.lookups.push(lookup);
        self
    }

    /// Builds and validates the rule.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::MissingField` when the trigger is absent,
    /// plus everything [`Rule::validate`] rejects.
    pub fn build(self) -> Result<Rule, ValidationError> {
        let trigger = self.trigger.ok_or_else(|| ValidationError::MissingField {
            field: "trigger".to_string(),
        })?;

        let name = match self.name {
            Some(name) => name,
            None => self.id.clone(),
        };

        let now = Utc::now();
        let rule = Rule {
            id: self.id,
            name,
            description: self.description,
            priority: self.priority,
            enabled: self.enabled,
            tags: self.tags,
            group: self.group,
            trigger,
            conditions: self.conditions,
            actions: self.actions,
            lookups: self.lookups,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        rule.validate()?;
        Ok(rule)
    }
}
