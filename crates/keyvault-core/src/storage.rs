//! Key-value storage contract and the two bundled backends.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::settings::VaultSettings;

/// String-keyed, string-valued persistent storage.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> std::result::Result<(), StorageError>;
    fn remove(&self, key: &str) -> std::result::Result<(), StorageError>;
    fn keys(&self) -> std::result::Result<Vec<String>, StorageError>;
}

/// Process-local storage. Also the fixture backend for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Copy of every entry, for comparing storage before and after an operation.
    pub fn dump(&self) -> BTreeMap<String, String> {
        self.entries.read().clone()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> std::result::Result<(), StorageError> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> std::result::Result<Vec<String>, StorageError> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// All entries in one JSON object on disk, rewritten atomically on each change.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
            restrict_dir_permissions(parent);
        }
        let entries = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                StorageError::Corrupt(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "opened file storage");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> std::result::Result<(), StorageError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StorageError::Io(e.error))?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> std::result::Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> std::result::Result<(), StorageError> {
        let mut guard = self.entries.write();
        let previous = guard.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush(&guard) {
            match previous {
                Some(old) => guard.insert(key.to_string(), old),
                None => guard.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> std::result::Result<(), StorageError> {
        let mut guard = self.entries.write();
        let Some(previous) = guard.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.flush(&guard) {
            guard.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn keys(&self) -> std::result::Result<Vec<String>, StorageError> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

pub fn settings_key(vault_key: &str) -> String {
    format!("{vault_key}_settings")
}

pub fn load_settings(storage: &dyn Storage, vault_key: &str) -> Result<VaultSettings> {
    if let Some(text) = storage.get(&settings_key(vault_key))? {
        Ok(serde_json::from_str(&text)?)
    } else {
        Ok(VaultSettings::default())
    }
}

pub fn save_settings(storage: &dyn Storage, vault_key: &str, settings: &VaultSettings) -> Result<()> {
    let data = serde_json::to_string(settings)?;
    storage.set(&settings_key(vault_key), &data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn memory_storage_basics() {
        let storage = MemoryStorage::with_entries([("b", "2"), ("a", "1")]);
        assert_eq!(storage.keys().unwrap(), vec!["a", "b"]);
        storage.set("c", "3").unwrap();
        storage.remove("a").unwrap();
        assert_eq!(storage.get("a").unwrap(), None);
        assert_eq!(storage.get("c").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn file_storage_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        {
            let storage = FileStorage::open(&path).unwrap();
            storage.set("k", "v").unwrap();
            storage.set("gone", "x").unwrap();
            storage.remove("gone").unwrap();
        }
        let reopened = FileStorage::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(reopened.keys().unwrap(), vec!["k"]);
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(FileStorage::open(&path), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn settings_roundtrip_under_vault_key() {
        let storage = MemoryStorage::new();
        assert_eq!(load_settings(&storage, "v").unwrap(), VaultSettings::default());
        let settings = VaultSettings { backup_retention: 9, ..Default::default() };
        save_settings(&storage, "v", &settings).unwrap();
        assert!(storage.get("v_settings").unwrap().is_some());
        assert_eq!(load_settings(&storage, "v").unwrap().backup_retention, 9);
    }
}
