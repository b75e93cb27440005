//! Per-rule version history and rollback support.
//!
//! Every lifecycle change appends a [`VersionEntry`] holding a full rule
//! snapshot, so any prior version can be re-applied. Histories persist under
//! `rule-version:{rule_id}` when a storage adapter is configured.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::rule::Rule;
use crate::storage::{keys, Persisted, StorageAdapter};

/// What kind of change produced a version entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Registered,
    Updated,
    Enabled,
    Disabled,
    RolledBack,
    Unregistered,
}

/// One entry in a rule's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// The rule version this entry captured.
    pub version: u64,
    /// Cause of the change.
    pub change_type: ChangeType,
    /// Full rule snapshot at this version.
    pub snapshot: Rule,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct HistoryState {
    entries: Vec<VersionEntry>,
}

/// In-memory version store with write-behind persistence.
#[derive(Default)]
pub struct VersionStore {
    histories: BTreeMap<String, Vec<VersionEntry>>,
    dirty: BTreeSet<String>,
}

impl VersionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry capturing the rule's current state.
    pub fn record(&mut self, rule: &Rule, change_type: ChangeType, now: DateTime<Utc>) {
        self.histories
            .entry(rule.id.clone())
            .or_default()
            .push(VersionEntry {
                version: rule.version,
                change_type,
                snapshot: rule.clone(),
                timestamp: now,
            });
        self.dirty.insert(rule.id.clone());
    }

    /// Full history for a rule, oldest first.
    #[must_use]
    pub fn history(&self, rule_id: &str) -> Option<&[VersionEntry]> {
        self.histories.get(rule_id).map(Vec::as_slice)
    }

    /// The entry that captured a specific version.
    #[must_use]
    pub fn entry(&self, rule_id: &str, version: u64) -> Option<&VersionEntry> {
        self.histories
            .get(rule_id)?
            .iter()
            .find(|e| e.version == version)
    }

    /// Loads all histories from an adapter, replacing in-memory state.
    pub fn load_from(&mut self, adapter: &dyn StorageAdapter) {
        let keys = match adapter.list_keys(Some(keys::RULE_VERSION_PREFIX)) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to list version histories");
                return;
            }
        };

        for key in keys {
            let rule_id = key
                .strip_prefix(keys::RULE_VERSION_PREFIX)
                .unwrap_or(&key)
                .to_string();
            match adapter.load(&key) {
                Ok(Some(payload)) => match payload.unwrap_state::<HistoryState>() {
                    Ok(state) => {
                        self.histories.insert(rule_id, state.entries);
                    }
                    Err(e) => warn!(%key, error = %e, "skipping malformed version history"),
                },
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "failed to load version history"),
            }
        }
        self.dirty.clear();
    }

    /// Writes dirty histories to an adapter.
    pub fn flush_to(&mut self, adapter: &dyn StorageAdapter, server_id: &str, now: DateTime<Utc>) {
        let dirty = std::mem::take(&mut self.dirty);
        for rule_id in dirty {
            let Some(entries) = self.histories.get(&rule_id) else {
                continue;
            };
            let state = HistoryState {
                entries: entries.clone(),
            };
            let payload = match Persisted::wrap(&state, server_id, now) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(%rule_id, error = %e, "failed to serialize version history");
                    continue;
                }
            };
            if let Err(e) = adapter.save(&keys::rule_version(&rule_id), &payload) {
                warn!(%rule_id, error = %e, "failed to persist version history");
                // Retry on the next flush.
                self.dirty.insert(rule_id);
            }
        }
    }
}
