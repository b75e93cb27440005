//! Glob matching over dotted event topics and colon-delimited fact keys.
//!
//! `*` matches exactly one segment, a trailing `**` matches all remaining
//! segments, and a bare `*` matches anything. Matching is purely lexical and
//! case-sensitive. Compiled matchers are cached by pattern string.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

const PATTERN_CACHE_MAX: usize = 1024;

static PATTERN_CACHE: OnceLock<RwLock<HashMap<(String, char), Arc<KeyPattern>>>> = OnceLock::new();

/// A compiled segment pattern over a delimited key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    raw: String,
    delimiter: char,
    segments: Vec<Segment>,
    match_all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
    Rest,
}

impl KeyPattern {
    /// Compiles a pattern for the given segment delimiter.
    #[must_use]
    pub fn compile(pattern: &str, delimiter: char) -> Self {
        if pattern == "*" || pattern == "**" {
            return Self {
                raw: pattern.to_string(),
                delimiter,
                segments: Vec::new(),
                match_all: true,
            };
        }

        let parts: Vec<&str> = pattern.split(delimiter).collect();
        let last = parts.len().saturating_sub(1);
        let segments = parts
            .iter()
            .enumerate()
            .map(|(i, part)| match *part {
                "*" => Segment::Any,
                "**" if i == last => Segment::Rest,
                other => Segment::Literal(other.to_string()),
            })
            .collect();

        Self {
            raw: pattern.to_string(),
            delimiter,
            segments,
            match_all: false,
        }
    }

    /// The original pattern string.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns true when the pattern contains no wildcards.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        !self.match_all
            && self
                .segments
                .iter()
                .all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Matches a key against this pattern.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        if self.match_all {
            return true;
        }

        let mut segments = self.segments.iter();
        let mut parts = key.split(self.delimiter);

        loop {
            match segments.next() {
                Some(Segment::Rest) => return true,
                Some(seg) => match parts.next() {
                    Some(part) => match seg {
                        Segment::Literal(lit) => {
                            if lit != part {
                                return false;
                            }
                        }
                        Segment::Any => {}
                        Segment::Rest => unreachable!("Rest handled above"),
                    },
                    None => return false,
                },
                None => return parts.next().is_none(),
            }
        }
    }
}

fn cached(pattern: &str, delimiter: char) -> Arc<KeyPattern> {
    let cache = PATTERN_CACHE.get_or_init(|| RwLock::new(HashMap::new()));
    let key = (pattern.to_string(), delimiter);

    if let Ok(guard) = cache.read() {
        if let Some(compiled) = guard.get(&key) {
            return Arc::clone(compiled);
        }
    }

    let compiled = Arc::new(KeyPattern::compile(pattern, delimiter));

    if let Ok(mut guard) = cache.write() {
        if guard.len() >= PATTERN_CACHE_MAX {
            // Keep the cache bounded to avoid unbounded memory usage.
            guard.clear();
        }
        guard.entry(key).or_insert_with(|| Arc::clone(&compiled));
    }
    compiled
}

/// Returns the cached compiled matcher for a dotted event-topic pattern.
#[must_use]
pub fn topic_pattern(pattern: &str) -> Arc<KeyPattern> {
    cached(pattern, '.')
}

/// Returns the cached compiled matcher for a colon-delimited fact-key pattern.
#[must_use]
pub fn fact_pattern(pattern: &str) -> Arc<KeyPattern> {
    cached(pattern, ':')
}

/// Glob-matches an event topic (`order.*`, `order.**`).
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    topic_pattern(pattern).matches(topic)
}

/// Glob-matches a fact key (`user:*:age`).
#[must_use]
pub fn fact_key_matches(pattern: &str, key: &str) -> bool {
    fact_pattern(pattern).matches(key)
}
