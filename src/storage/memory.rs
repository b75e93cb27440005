//! In-memory storage adapter for tests and embedded use.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{Persisted, StorageAdapter, StorageError};

/// A process-local adapter backed by a map.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    entries: RwLock<BTreeMap<String, Persisted>>,
}

impl MemoryAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageAdapter for MemoryAdapter {
    fn save(&self, key: &str, payload: &Persisted) -> Result<(), StorageError> {
        self.entries
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?
            .insert(key.to_string(), payload.clone());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Persisted>, StorageError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?
            .get(key)
            .cloned())
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .entries
            .write()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?
            .remove(key)
            .is_some())
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?
            .contains_key(key))
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let guard = self
            .entries
            .read()
            .map_err(|_| StorageError::Backend("lock poisoned".to_string()))?;
        Ok(guard
            .keys()
            .filter(|k| prefix.is_none_or(|p| k.starts_with(p)))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payload(n: u64) -> Persisted {
        Persisted::wrap(&n, "test", Utc::now()).unwrap()
    }

    #[test]
    fn test_save_load_delete() {
        let adapter = MemoryAdapter::new();
        adapter.save("a", &payload(1)).unwrap();

        assert!(adapter.exists("a").unwrap());
        let loaded = adapter.load("a").unwrap().unwrap();
        assert_eq!(loaded.unwrap_state::<u64>().unwrap(), 1);

        assert!(adapter.delete("a").unwrap());
        assert!(!adapter.delete("a").unwrap());
        assert!(adapter.load("a").unwrap().is_none());
    }

    #[test]
    fn test_list_keys_with_prefix() {
        let adapter = MemoryAdapter::new();
        adapter.save("rule-version:r1", &payload(1)).unwrap();
        adapter.save("rule-version:r2", &payload(2)).unwrap();
        adapter.save("facts", &payload(3)).unwrap();

        let keys = adapter.list_keys(Some("rule-version:")).unwrap();
        assert_eq!(keys, vec!["rule-version:r1", "rule-version:r2"]);
        assert_eq!(adapter.list_keys(None).unwrap().len(), 3);
    }
}
