//! Condition evaluation.
//!
//! Conditions AND together. The left-hand source resolves against the
//! evaluation context; fact-glob sources use any-match semantics. An
//! undefined source satisfies only `not_exists`.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::context::EvalContext;
use crate::error::{ValidationError, VerdictError, VerdictResult};
use crate::rule::{Condition, ConditionSource, Operator};
use crate::value::Value;

const REGEX_CACHE_MAX: usize = 1024;

static REGEX_CACHE: OnceLock<RwLock<HashMap<String, regex::Regex>>> = OnceLock::new();

fn cached_regex(pattern: &str) -> VerdictResult<regex::Regex> {
    let cache = REGEX_CACHE.get_or_init(|| RwLock::new(HashMap::new()));

    {
        let guard = cache
            .read()
            .map_err(|_| VerdictError::internal("regex cache lock poisoned"))?;
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
    }

    let compiled = regex::Regex::new(pattern).map_err(|e| {
        VerdictError::Validation(ValidationError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    })?;

    let mut guard = cache
        .write()
        .map_err(|_| VerdictError::internal("regex cache lock poisoned"))?;

    if guard.len() >= REGEX_CACHE_MAX {
        // Keep the cache bounded to avoid unbounded memory usage.
        guard.clear();
    }

    // Another thread may have inserted it while we compiled.
    guard
        .entry(pattern.to_string())
        .or_insert_with(|| compiled.clone());
    Ok(compiled)
}

/// A resolved condition source.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// The path resolved to nothing.
    Missing,
    /// A single value.
    One(Value),
    /// Multiple fact-glob matches; any-match semantics apply.
    Many(Vec<Value>),
}

/// Resolves a condition source against the context.
#[must_use]
pub fn resolve_source(source: &ConditionSource, ctx: &EvalContext<'_>) -> Resolved {
    match source {
        ConditionSource::Event { field } => {
            let path = format!("event.{field}");
            ctx.resolve_path(&path).map_or(Resolved::Missing, Resolved::One)
        }
        ConditionSource::Fact { pattern } => {
            let matches = ctx.facts().query(pattern);
            match matches.len() {
                0 => Resolved::Missing,
                1 => Resolved::One(matches.into_iter().next().map(|f| f.value).unwrap_or_default()),
                _ => Resolved::Many(matches.into_iter().map(|f| f.value).collect()),
            }
        }
        ConditionSource::Context { key } => {
            let path = format!("context.{key}");
            ctx.resolve_path(&path).map_or(Resolved::Missing, Resolved::One)
        }
        ConditionSource::Lookup { name, field } => {
            let path = match field {
                Some(field) => format!("lookups.{name}.{field}"),
                None => format!("lookups.{name}"),
            };
            ctx.resolve_path(&path).map_or(Resolved::Missing, Resolved::One)
        }
    }
}

/// Applies an operator to a defined source value.
///
/// # Errors
///
/// `matches` propagates regex compilation failures.
pub fn apply_operator(operator: Operator, source: &Value, value: &Value) -> VerdictResult<bool> {
    let result = match operator {
        Operator::Eq => source == value,
        Operator::Neq => source != value,

        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            match (source.as_f64(), value.as_f64()) {
                (Some(lhs), Some(rhs)) => match operator {
                    Operator::Gt => lhs > rhs,
                    Operator::Gte => lhs >= rhs,
                    Operator::Lt => lhs < rhs,
                    Operator::Lte => lhs <= rhs,
                    _ => unreachable!(),
                },
                // Any non-number on either side compares false.
                _ => false,
            }
        }

        Operator::In | Operator::NotIn => {
            let contained = value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| item == source));
            match operator {
                Operator::In => contained,
                _ => value.as_array().is_some() && !contained,
            }
        }

        Operator::Contains | Operator::NotContains => {
            let contained = match source {
                Value::String(s) => s.contains(&value.coerce_string()),
                Value::Array(items) => items.iter().any(|item| item == value),
                _ => false,
            };
            match operator {
                Operator::Contains => contained,
                _ => !contained,
            }
        }

        Operator::Matches => match source.as_str() {
            Some(s) => {
                let pattern = value.coerce_string();
                cached_regex(&pattern)?.is_match(s)
            }
            None => false,
        },

        Operator::Exists => !source.is_null(),
        Operator::NotExists => source.is_null(),
    };
    Ok(result)
}

/// Evaluates a single condition.
///
/// # Errors
///
/// Propagates `matches` regex failures.
pub fn evaluate_condition(condition: &Condition, ctx: &EvalContext<'_>) -> VerdictResult<bool> {
    let value = ctx.resolve_value(&condition.value);

    match resolve_source(&condition.source, ctx) {
        Resolved::Missing => Ok(matches!(condition.operator, Operator::NotExists)),
        Resolved::One(source) => apply_operator(condition.operator, &source, &value),
        Resolved::Many(sources) => {
            // Any-match: the condition passes if any matched fact passes.
            for source in &sources {
                if apply_operator(condition.operator, source, &value)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Evaluates conditions as a conjunction.
///
/// # Errors
///
/// Propagates the first evaluation failure.
pub fn evaluate_all(conditions: &[Condition], ctx: &EvalContext<'_>) -> VerdictResult<bool> {
    for condition in conditions {
        if !evaluate_condition(condition, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}
