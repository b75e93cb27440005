//! YAML rule authoring.
//!
//! YAML documents deserialize straight into the canonical [`Rule`] shape;
//! reference normalization (`${path}` and `{ref: path}` both become explicit
//! reference nodes) and duration parsing happen inside the serde layer, so
//! authored YAML, canonical JSON and builder-produced rules are one
//! representation.

use serde::Deserialize;

use crate::error::{ValidationError, VerdictResult};
use crate::rule::Rule;

/// Parses a single YAML rule document.
///
/// # Errors
///
/// Returns `ValidationError::InvalidYaml` on parse failure, plus everything
/// [`Rule::validate`] rejects.
///
/// # Example
/// ```
/// let rule = verdict::yaml::rule_from_yaml(r#"
/// id: premium-orders
/// name: Flag premium orders
/// priority: 10
/// trigger:
///   type: event
///   topic: order.created
/// conditions:
///   - source: {type: event, field: amount}
///     operator: gte
///     value: 100
/// actions:
///   - type: emit_event
///     topic: order.premium
///     data:
///       amount: "${event.amount}"
/// "#).unwrap();
/// assert_eq!(rule.id, "premium-orders");
/// ```
pub fn rule_from_yaml(input: &str) -> VerdictResult<Rule> {
    let rule: Rule = serde_yaml::from_str(input).map_err(|e| ValidationError::InvalidYaml {
        reason: e.to_string(),
    })?;
    rule.validate()?;
    Ok(rule)
}

/// Parses a multi-document YAML stream of rules.
///
/// # Errors
///
/// Fails on the first malformed or invalid document.
pub fn rules_from_yaml(input: &str) -> VerdictResult<Vec<Rule>> {
    let mut rules = Vec::new();
    for document in serde_yaml::Deserializer::from_str(input) {
        let rule = Rule::deserialize(document).map_err(|e| ValidationError::InvalidYaml {
            reason: e.to_string(),
        })?;
        rule.validate()?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Serializes a rule to YAML.
///
/// # Errors
///
/// Returns `ValidationError::InvalidYaml` when serialization fails.
pub fn rule_to_yaml(rule: &Rule) -> VerdictResult<String> {
    serde_yaml::to_string(rule).map_err(|e| {
        ValidationError::InvalidYaml {
            reason: e.to_string(),
        }
        .into()
    })
}

/// The canonical JSON form of a rule.
///
/// # Errors
///
/// Returns `ValidationError::InvalidYaml` when serialization fails.
pub fn canonical_json(rule: &Rule) -> VerdictResult<serde_json::Value> {
    serde_json::to_value(rule).map_err(|e| {
        ValidationError::InvalidYaml {
            reason: e.to_string(),
        }
        .into()
    })
}
