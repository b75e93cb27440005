//! Pluggable key/value persistence.
//!
//! The engine treats storage as write-behind: in-memory state is
//! authoritative, adapters receive periodic snapshots and a final flush on
//! stop. Operations are assumed idempotent and eventually durable; ordering
//! across keys is not required.

mod memory;

#[cfg(feature = "persistent")]
mod file;

pub use memory::MemoryAdapter;

#[cfg(feature = "persistent")]
pub use file::FileAdapter;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current payload schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored data failed an integrity check.
    #[error("Corrupt payload for key '{key}': {reason}")]
    Corrupt {
        /// Affected key.
        key: String,
        /// Detail.
        reason: String,
    },
}

/// Envelope metadata attached to every persisted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistMeta {
    /// When the payload was written.
    pub persisted_at: DateTime<Utc>,
    /// Identity of the writing engine instance.
    pub server_id: String,
    /// Payload schema version.
    pub schema_version: u32,
}

/// A persisted payload: opaque state plus envelope metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persisted {
    /// Adapter-opaque state.
    pub state: serde_json::Value,
    /// Envelope metadata.
    pub metadata: PersistMeta,
}

impl Persisted {
    /// Wraps a serializable state in an envelope.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` when the state cannot be
    /// converted to JSON.
    pub fn wrap<T: Serialize>(
        state: &T,
        server_id: &str,
        persisted_at: DateTime<Utc>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            state: serde_json::to_value(state)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            metadata: PersistMeta {
                persisted_at,
                server_id: server_id.to_string(),
                schema_version: SCHEMA_VERSION,
            },
        })
    }

    /// Deserializes the wrapped state.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` on shape mismatch.
    pub fn unwrap_state<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_value(self.state.clone())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

/// A key/value persistence backend.
///
/// Implementations must be safe to call from the dispatch thread; slow
/// backends should buffer internally rather than block.
pub trait StorageAdapter: Send + Sync {
    /// Writes a payload.
    fn save(&self, key: &str, payload: &Persisted) -> Result<(), StorageError>;

    /// Reads a payload.
    fn load(&self, key: &str) -> Result<Option<Persisted>, StorageError>;

    /// Deletes a key. Returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Returns whether a key exists.
    fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Lists keys, optionally filtered by prefix, in lexical order.
    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError>;
}

/// Well-known persistence keys used by the engine.
pub mod keys {
    /// Fact store snapshot.
    pub const FACTS: &str = "facts";
    /// Rule set snapshot.
    pub const RULES: &str = "rules";
    /// Rule group snapshot.
    pub const GROUPS: &str = "groups";
    /// Per-rule version history prefix; full key is `rule-version:{rule_id}`.
    pub const RULE_VERSION_PREFIX: &str = "rule-version:";
    /// Audit bucket prefix; full key is `audit:{category}:{yyyy-mm-dd}`.
    pub const AUDIT_PREFIX: &str = "audit:";

    /// Version-history key for a rule.
    #[must_use]
    pub fn rule_version(rule_id: &str) -> String {
        format!("{RULE_VERSION_PREFIX}{rule_id}")
    }
}
