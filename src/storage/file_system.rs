use std::fs;
use std::path::PathBuf;

use super::{validate_key, Store};
use crate::error::StorageError;

/// One `<key>.json` file per key under a base directory
#[derive(Clone, Debug)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a store rooted at the default directory ("./wallets")
    pub fn new() -> Self {
        Self {
            base_path: PathBuf::from("./wallets"),
        }
    }

    /// Create a store with a custom base directory
    pub fn new_with_base_dir(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_path
    }

    fn path_of(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.base_path.join(format!("{}.json", key)))
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_of(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Writes go to a temporary file first and are renamed into place
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_of(key)?;
        fs::create_dir_all(&self.base_path)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_of(key)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn clear(&self, prefix: &str) -> Result<(), StorageError> {
        if !self.base_path.exists() {
            return Ok(());
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if path.is_file() && name.starts_with(prefix) && name.ends_with(".json") {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        log::warn!("Cleared {} stored entries with prefix '{}'", removed, prefix);
        Ok(())
    }
}
