use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{validate_key, Store};
use crate::error::StorageError;

/// In-process store, lost on drop
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.entries.lock().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("memory store lock poisoned: {}", e),
            ))
        })
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn clear(&self, prefix: &str) -> Result<(), StorageError> {
        self.lock()?.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_is_prefix_scoped() {
        let store = MemoryStore::new();
        store.set("a_state", "1").unwrap();
        store.set("a_addresses", "2").unwrap();
        store.set("b_state", "3").unwrap();

        store.clear("a_").unwrap();
        assert_eq!(store.get("a_state").unwrap(), None);
        assert_eq!(store.get("b_state").unwrap(), Some("3".to_string()));
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.set("../escape", "x"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
