//! Persistence of the user → environment mapping.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One record per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub environment_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub initialized: bool,
}

pub trait EnvironmentStore: Send + Sync {
    fn load(&self, user_id: &str) -> Result<Option<UserRecord>>;
    fn save(&self, user_id: &str, record: &UserRecord) -> Result<()>;
}

/// All records in a single JSON object keyed by user id.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, UserRecord>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, records: &HashMap<String, UserRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl EnvironmentStore for JsonFileStore {
    fn load(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        Ok(self.read_all()?.remove(user_id))
    }

    fn save(&self, user_id: &str, record: &UserRecord) -> Result<()> {
        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        let mut records = self.read_all()?;
        records.insert(user_id.to_string(), record.clone());
        self.write_all(&records)
    }
}

/// Process-local store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, UserRecord>>,
}

#[cfg(test)]
impl EnvironmentStore for MemoryStore {
    fn load(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.get(user_id).cloned())
    }

    fn save(&self, user_id: &str, record: &UserRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.insert(user_id.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> UserRecord {
        let now = Utc::now();
        UserRecord {
            environment_id: id.into(),
            created_at: now,
            last_used: now,
            initialized: false,
        }
    }

    #[test]
    fn json_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_db.json");

        let store = JsonFileStore::new(&path);
        assert_eq!(store.load("42").unwrap(), None);
        store.save("42", &record("env-a")).unwrap();
        store.save("7", &record("env-b")).unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.load("42").unwrap().unwrap().environment_id, "env-a");
        assert_eq!(reopened.load("7").unwrap().unwrap().environment_id, "env-b");
    }

    #[test]
    fn empty_file_reads_as_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_db.json");
        std::fs::write(&path, "{}").unwrap();
        let store = JsonFileStore::new(&path);
        assert_eq!(store.load("1").unwrap(), None);

        std::fs::write(&path, "").unwrap();
        assert_eq!(store.load("1").unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user_db.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(JsonFileStore::new(&path).load("1").is_err());
    }

    #[test]
    fn missing_initialized_flag_defaults_false() {
        let json = r#"{"environment_id":"e","created_at":"2024-01-01T00:00:00Z","last_used":"2024-01-01T00:00:00Z"}"#;
        let parsed: UserRecord = serde_json::from_str(json).unwrap();
        assert!(!parsed.initialized);
    }
}
