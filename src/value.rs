//! Value types flowing through events, facts, conditions and actions.
//!
//! Payloads are structured JSON-like values. References into the evaluation
//! context are first-class: a whole-string `"${path}"` or a single-key
//! `{ref: "path"}` mapping deserializes to [`Value::Ref`], so resolution
//! never has to inspect strings at evaluation time.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered mapping used for event data and object values.
pub type Map = BTreeMap<String, Value>;

/// A structured value.
///
/// `Int` and `Float` compare numerically against each other; everything else
/// compares structurally.
///
/// # Examples
///
/// ```
/// use verdict::Value;
///
/// let v: Value = serde_json::from_str("\"${event.amount}\"").unwrap();
/// assert_eq!(v, Value::reference("event.amount"));
///
/// let v: Value = serde_json::from_str("{\"ref\": \"fact.user:1:age\"}").unwrap();
/// assert_eq!(v, Value::reference("fact.user:1:age"));
/// ```
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(Map),
    /// A deferred reference into the evaluation context.
    Ref {
        /// Dot-notated context path (`event.amount`, `fact.user:1:age`).
        path: String,
    },
}

impl Value {
    /// Creates a reference value.
    #[must_use]
    pub fn reference(path: impl Into<String>) -> Self {
        Self::Ref { path: path.into() }
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn is_ref(&self) -> bool {
        matches!(self, Self::Ref { .. })
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view: both `Int` and `Float` read as `f64`.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_object(&self) -> Option<&Map> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Ref { .. } => "ref",
        }
    }

    /// Descends into the value along dot-separated path segments.
    ///
    /// Array segments accept decimal indices. Returns `None` when any segment
    /// is missing.
    #[must_use]
    pub fn get_path(&self, segments: &[&str]) -> Option<&Value> {
        let mut current = self;
        for seg in segments {
            current = match current {
                Self::Object(map) => map.get(*seg)?,
                Self::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Returns true if this value contains no unresolved references.
    #[must_use]
    pub fn is_concrete(&self) -> bool {
        match self {
            Self::Ref { .. } => false,
            Self::String(s) => !contains_template(s),
            Self::Array(items) => items.iter().all(Value::is_concrete),
            Self::Object(map) => map.values().all(Value::is_concrete),
            _ => true,
        }
    }

    /// Renders the value for string interpolation.
    ///
    /// Strings render raw (no quotes); composites render as compact JSON.
    #[must_use]
    pub fn coerce_string(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::String(v) => v.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// Returns true if `s` contains a `${…}` interpolation token.
#[must_use]
pub fn contains_template(s: &str) -> bool {
    s.contains("${")
}

/// If `s` is a single whole-string `${path}` token, returns the path.
#[must_use]
pub fn whole_template(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains("${") {
        return None;
    }
    Some(inner)
}

impl Default for Value {
    fn default() -> Self {
        Self::Null
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Ref { path: a }, Self::Ref { path: b }) => a == b,
            // Numeric cross-equality: Int(1) == Float(1.0).
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ref { path } => write!(f, "${{{path}}}"),
            other => write!(f, "{}", other.coerce_string()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(v) => serializer.serialize_bool(*v),
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
            Self::String(v) => serializer.serialize_str(v),
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            Self::Ref { path } => {
                let mut out = serializer.serialize_map(Some(1))?;
                out.serialize_entry("ref", path)?;
                out.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON-like value")
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(i64::try_from(v).map_or(Value::Float(v as f64), Value::Int))
    }

    fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Value, E> {
        // Whole-string ${path} normalizes to an explicit reference.
        Ok(match whole_template(v) {
            Some(path) => Value::reference(path),
            None => Value::String(v.to_string()),
        })
    }

    fn visit_string<E: serde::de::Error>(self, v: String) -> Result<Value, E> {
        self.visit_str(&v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
        let mut map = Map::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            map.insert(key, value);
        }

        // Single-key {ref: "path"} normalizes to an explicit reference.
        if map.len() == 1 {
            if let Some(Value::String(path)) = map.get("ref") {
                return Ok(Value::reference(path.clone()));
            }
        }
        Ok(Value::Object(map))
    }
}

// Convenient From implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::Array(v)
    }
}

impl From<Map> for Value {
    fn from(v: Map) -> Self {
        Self::Object(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_cross_equality() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Float(1.5));
        assert_ne!(Value::Int(1), Value::String("1".to_string()));
    }

    #[test]
    fn test_whole_template_detection() {
        assert_eq!(whole_template("${event.amount}"), Some("event.amount"));
        assert_eq!(whole_template("order ${id}"), None);
        assert_eq!(whole_template("${a}${b}"), None);
        assert_eq!(whole_template("${}"), None);
        assert_eq!(whole_template("plain"), None);
    }

    #[test]
    fn test_deserialize_normalizes_refs() {
        let v: Value = serde_json::from_str(r#""${fact.user:1:age}""#).unwrap();
        assert_eq!(v, Value::reference("fact.user:1:age"));

        let v: Value = serde_json::from_str(r#"{"ref": "event.total"}"#).unwrap();
        assert_eq!(v, Value::reference("event.total"));

        // A two-key map containing "ref" stays an object.
        let v: Value = serde_json::from_str(r#"{"ref": "x", "other": 1}"#).unwrap();
        assert!(v.as_object().is_some());
    }

    #[test]
    fn test_template_strings_stay_strings() {
        let v: Value = serde_json::from_str(r#""order ${event.id} created""#).unwrap();
        let Value::String(s) = &v else {
            panic!("expected string, got {v:?}");
        };
        assert!(contains_template(s));
        assert!(!v.is_concrete());
    }

    #[test]
    fn test_serialize_ref_round_trips() {
        let v = Value::reference("lookups.user.name");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"ref":"lookups.user.name"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn test_get_path() {
        let v: Value = serde_json::from_str(r#"{"order": {"items": [{"sku": "a"}]}}"#).unwrap();
        assert_eq!(
            v.get_path(&["order", "items", "0", "sku"]),
            Some(&Value::String("a".to_string()))
        );
        assert_eq!(v.get_path(&["order", "missing"]), None);
    }

    #[test]
    fn test_coerce_string() {
        assert_eq!(Value::String("hi".into()).coerce_string(), "hi");
        assert_eq!(Value::Int(42).coerce_string(), "42");
        assert_eq!(Value::Null.coerce_string(), "null");
        assert_eq!(Value::Bool(true).coerce_string(), "true");
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Int(2)]).coerce_string(),
            "[1,2]"
        );
    }

    #[test]
    fn test_yaml_deserializes_with_same_normalization() {
        let v: Value = serde_yaml::from_str("ref: event.amount").unwrap();
        assert_eq!(v, Value::reference("event.amount"));

        let v: Value = serde_yaml::from_str("\"${event.amount}\"").unwrap();
        assert_eq!(v, Value::reference("event.amount"));
    }

    #[test]
    fn test_large_u64_falls_back_to_float() {
        let v: Value = serde_json::from_str("18446744073709551615").unwrap();
        assert!(matches!(v, Value::Float(_)));
    }
}
