//! Persistent key/value storage in a JSON file
//!
//! Holds state that must survive a restart without living in the document
//! store, namely the cached admin sessions.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::store::StoreError;

pub struct LocalStorage {
    path: PathBuf,
    // Serialises read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl LocalStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let map = load_map(&self.path)?;
        match map.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut map = load_map(&self.path)?;
        map.insert(key.to_string(), serde_json::to_value(value)?);
        save_map(&map, &self.path)
    }

    /// Remove a key, returning whether it was present
    pub fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut map = load_map(&self.path)?;
        let removed = map.remove(key).is_some();
        if removed {
            save_map(&map, &self.path)?;
        }
        Ok(removed)
    }

    /// All keys starting with the given prefix
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let map = load_map(&self.path)?;
        Ok(map.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

fn load_map(path: &Path) -> Result<Map<String, Value>, StoreError> {
    if !path.exists() {
        return Ok(Map::new());
    }

    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Map::new());
    }

    let map: Map<String, Value> = serde_json::from_str(&content)?;
    debug!(count = map.len(), path = %path.display(), "Loaded local storage");
    Ok(map)
}

fn save_map(map: &Map<String, Value>, path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(map)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage(dir: &TempDir) -> LocalStorage {
        LocalStorage::new(dir.path().join("storage.json"))
    }

    #[test]
    fn test_get_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        let value: Option<String> = storage.get("anything").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_set_and_get() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);

        storage.set("greeting", &"bonjour").unwrap();
        let value: Option<String> = storage.get("greeting").unwrap();
        assert_eq!(value.as_deref(), Some("bonjour"));
        assert!(storage.path().exists());
    }

    #[test]
    fn test_values_survive_new_instance() {
        let temp_dir = TempDir::new().unwrap();
        storage(&temp_dir).set("n", &42).unwrap();

        let value: Option<i32> = storage(&temp_dir).get("n").unwrap();
        assert_eq!(value, Some(42));
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);
        storage.set("a", &1).unwrap();

        assert!(storage.remove("a").unwrap());
        assert!(!storage.remove("a").unwrap());
        let value: Option<i32> = storage.get("a").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_keys_with_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);
        storage.set("session:1", &1).unwrap();
        storage.set("session:2", &2).unwrap();
        storage.set("other", &3).unwrap();

        let mut keys = storage.keys_with_prefix("session:").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["session:1", "session:2"]);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = storage(&temp_dir);
        std::fs::write(storage.path(), "not valid json").unwrap();

        let result: Result<Option<i32>, _> = storage.get("a");
        assert!(result.is_err());
    }
}
