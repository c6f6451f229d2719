//! Storage and persistence layer
//!
//! - [`Store`] trait: string key/value store with prefix-scoped clearing
//! - [`MemoryStore`] for tests and ephemeral wallets
//! - [`FileStore`] writing one JSON document per key

mod file_system;
mod memory;

pub use file_system::FileStore;
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Remove every key starting with `prefix`
    fn clear(&self, prefix: &str) -> Result<(), StorageError>;
}

/// Serialize `value` as JSON under `key`
pub fn save_json<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_string(value)?;
    store.set(key, &json)
}

/// Load a JSON document, `None` if the key was never written
pub fn load_json<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Reject keys that cannot be mapped to a single file name
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}
