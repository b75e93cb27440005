//! Embedded durable storage adapter.
//!
//! One checksummed file per key inside a directory. The file body is a JSON
//! record `{key, payload}` prefixed with a hex CRC32 line; a mismatch on read
//! surfaces as `StorageError::Corrupt` rather than silently loading garbage.
//! Single-process by contract; there is no cross-process locking.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{Persisted, StorageAdapter, StorageError};

#[derive(Serialize, Deserialize)]
struct Record {
    key: String,
    payload: Persisted,
}

/// Directory-backed adapter with CRC32 corruption detection.
#[derive(Debug)]
pub struct FileAdapter {
    dir: PathBuf,
}

impl FileAdapter {
    /// Opens (creating if needed) the storage directory.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Backend` when the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain separators; file names are content-addressed.
        let digest = blake3::hash(key.as_bytes());
        self.dir.join(format!("{}.json", digest.to_hex()))
    }

    fn read_record(path: &Path) -> Result<Record, StorageError> {
        let raw = fs::read(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        let key_hint = path.display().to_string();

        let newline = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| StorageError::Corrupt {
                key: key_hint.clone(),
                reason: "missing checksum header".to_string(),
            })?;
        let (header, body) = raw.split_at(newline);
        let body = &body[1..];

        let expected = std::str::from_utf8(header)
            .ok()
            .and_then(|h| u32::from_str_radix(h.trim(), 16).ok())
            .ok_or_else(|| StorageError::Corrupt {
                key: key_hint.clone(),
                reason: "malformed checksum header".to_string(),
            })?;

        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(StorageError::Corrupt {
                key: key_hint,
                reason: format!("crc mismatch: expected {expected:08x}, got {actual:08x}"),
            });
        }

        serde_json::from_slice(body).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn records(&self) -> Result<Vec<Record>, StorageError> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| StorageError::Backend(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(Self::read_record(&path)?);
            }
        }
        Ok(out)
    }
}

impl StorageAdapter for FileAdapter {
    fn save(&self, key: &str, payload: &Persisted) -> Result<(), StorageError> {
        let record = Record {
            key: key.to_string(),
            payload: payload.clone(),
        };
        let body =
            serde_json::to_vec(&record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&body);

        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");

        // Write-then-rename so readers never observe a torn file.
        let mut file = fs::File::create(&tmp).map_err(|e| StorageError::Backend(e.to_string()))?;
        writeln!(file, "{checksum:08x}").map_err(|e| StorageError::Backend(e.to_string()))?;
        file.write_all(&body)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        file.sync_all()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Persisted>, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_record(&path)?.payload))
    }

    fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(true)
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.path_for(key).exists())
    }

    fn list_keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .records()?
            .into_iter()
            .map(|r| r.key)
            .filter(|k| prefix.is_none_or(|p| k.starts_with(p)))
            .collect();
        keys.sort();
        Ok(keys)
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
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(dir.path()).unwrap();

        adapter.save("rule-version:r1", &payload(7)).unwrap();
        let loaded = adapter.load("rule-version:r1").unwrap().unwrap();
        assert_eq!(loaded.unwrap_state::<u64>().unwrap(), 7);

        // Overwrite is idempotent.
        adapter.save("rule-version:r1", &payload(8)).unwrap();
        let loaded = adapter.load("rule-version:r1").unwrap().unwrap();
        assert_eq!(loaded.unwrap_state::<u64>().unwrap(), 8);
    }

    #[test]
    fn test_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(dir.path()).unwrap();
        assert!(adapter.load("nope").unwrap().is_none());
        assert!(!adapter.exists("nope").unwrap());
        assert!(!adapter.delete("nope").unwrap());
    }

    #[test]
    fn test_list_keys_reads_stored_key_names() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(dir.path()).unwrap();
        adapter.save("audit:fact:2024-01-01", &payload(1)).unwrap();
        adapter.save("facts", &payload(2)).unwrap();

        assert_eq!(
            adapter.list_keys(Some("audit:")).unwrap(),
            vec!["audit:fact:2024-01-01"]
        );
        assert_eq!(adapter.list_keys(None).unwrap().len(), 2);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(dir.path()).unwrap();
        adapter.save("k", &payload(1)).unwrap();

        // Flip a byte in the body.
        let path = adapter.path_for("k");
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        fs::write(&path, raw).unwrap();

        let err = adapter.load("k").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let adapter = FileAdapter::open(dir.path()).unwrap();
            adapter.save("facts", &payload(42)).unwrap();
        }
        let adapter = FileAdapter::open(dir.path()).unwrap();
        let loaded = adapter.load("facts").unwrap().unwrap();
        assert_eq!(loaded.unwrap_state::<u64>().unwrap(), 42);
    }
}
