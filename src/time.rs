//! Clock abstraction and duration parsing.
//!
//! The engine never reads the system clock directly; every timestamp comes
//! from an injected [`Clock`] so tests can drive virtual time through timers,
//! temporal windows and cache TTLs.

use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock for tests.
///
/// Starts at the Unix epoch unless constructed with [`ManualClock::starting_at`].
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc.timestamp_opt(0, 0).single().unwrap_or_default())
    }

    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        }
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.read().map(|g| *g).unwrap_or_default()
    }
}

/// A duration expressed in milliseconds.
///
/// Deserializes from a positive integer (ms) or a string matching
/// `^\d+(ms|s|m|h|d|w|y)$`; serializes as integer milliseconds so canonical
/// JSON is stable regardless of the authored form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DurationMs(u64);

impl DurationMs {
    #[must_use]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn as_std(self) -> Duration {
        Duration::from_millis(self.0)
    }

    #[must_use]
    pub fn as_chrono(self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.0.min(i64::MAX as u64) as i64)
    }

    /// Parses a duration from the string form.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidDuration` when the input does not
    /// match `^\d+(ms|s|m|h|d|w|y)$`.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidDuration {
            input: input.to_string(),
        };

        let split = input
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .ok_or_else(invalid)?;
        if split == 0 {
            return Err(invalid());
        }

        let (digits, unit) = input.split_at(split);
        let amount: u64 = digits.parse().map_err(|_| invalid())?;

        let multiplier: u64 = match unit {
            "ms" => 1,
            "s" => 1000,
            "m" => 60 * 1000,
            "h" => 60 * 60 * 1000,
            "d" => 24 * 60 * 60 * 1000,
            "w" => 7 * 24 * 60 * 60 * 1000,
            "y" => 365 * 24 * 60 * 60 * 1000,
            _ => return Err(invalid()),
        };

        amount.checked_mul(multiplier).map(Self).ok_or_else(invalid)
    }
}

impl fmt::Display for DurationMs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<Duration> for DurationMs {
    fn from(d: Duration) -> Self {
        Self(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

impl Serialize for DurationMs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for DurationMs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }
}

struct DurationVisitor;

impl Visitor<'_> for DurationVisitor {
    type Value = DurationMs;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("milliseconds or a duration string like \"5m\"")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<DurationMs, E> {
        Ok(DurationMs(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<DurationMs, E> {
        u64::try_from(v)
            .map(DurationMs)
            .map_err(|_| E::custom("duration must be non-negative"))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<DurationMs, E> {
        DurationMs::parse(v).map_err(E::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(DurationMs::parse("250ms").unwrap().as_millis(), 250);
        assert_eq!(DurationMs::parse("5s").unwrap().as_millis(), 5_000);
        assert_eq!(DurationMs::parse("5m").unwrap().as_millis(), 300_000);
        assert_eq!(DurationMs::parse("2h").unwrap().as_millis(), 7_200_000);
        assert_eq!(DurationMs::parse("1d").unwrap().as_millis(), 86_400_000);
        assert_eq!(DurationMs::parse("1w").unwrap().as_millis(), 604_800_000);
        assert_eq!(DurationMs::parse("1y").unwrap().as_millis(), 31_536_000_000);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for input in ["", "ms", "5", "5 m", "-5s", "5sec", "1.5s"] {
            assert!(DurationMs::parse(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn test_deserialize_int_and_string() {
        let d: DurationMs = serde_json::from_str("1500").unwrap();
        assert_eq!(d.as_millis(), 1500);

        let d: DurationMs = serde_json::from_str("\"90s\"").unwrap();
        assert_eq!(d.as_millis(), 90_000);

        assert!(serde_json::from_str::<DurationMs>("\"soon\"").is_err());
    }

    #[test]
    fn test_serialize_is_canonical_millis() {
        let d: DurationMs = serde_json::from_str("\"1m\"").unwrap();
        assert_eq!(serde_json::to_string(&d).unwrap(), "60000");
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - t0, chrono::Duration::seconds(90));
    }
}
