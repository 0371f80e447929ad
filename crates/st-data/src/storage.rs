use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use st_types::TuneResult;

use crate::cache::CacheKey;

/// On-disk record. The canonical key is stored next to the value so a
/// digest collision can never return the wrong entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: serde_json::Value,
}

/// Disk-backed key → value store, one JSON file per key.
///
/// Layout: `<root>/<computation name>/<key digest>.json`. Writes go to a
/// temporary file first and are renamed into place, so a crashed writer
/// never leaves a half-written entry behind.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn open<P: AsRef<Path>>(root: P) -> TuneResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generate the storage path for a key
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let dir: String = key
            .name()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(dir).join(format!("{}.json", key.digest().simple()))
    }

    pub fn load(&self, key: &CacheKey) -> TuneResult<Option<serde_json::Value>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&path)?;
        let entry: StoredEntry = serde_json::from_str(&text)?;
        if entry.key != key.canonical() {
            warn!("Cache entry {} belongs to a different key, ignoring", path.display());
            return Ok(None);
        }

        debug!("Loaded cache entry {}", path.display());
        Ok(Some(entry.value))
    }

    pub fn save(&self, key: &CacheKey, value: &serde_json::Value) -> TuneResult<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entry = StoredEntry {
            key: key.canonical().to_string(),
            value: value.clone(),
        };
        let tmp = path.with_extension(format!("json.tmp-{}", Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        fs::rename(&tmp, &path)?;

        debug!("Stored cache entry {}", path.display());
        Ok(())
    }

    /// Delete the entry for `key`. Returns whether one existed.
    pub fn remove(&self, key: &CacheKey) -> TuneResult<bool> {
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(seed: u64) -> CacheKey {
        CacheKey::builder("train/surrogate")
            .arg("system", "pendulum")
            .seed("train_seed", seed)
            .build()
            .unwrap()
    }

    #[test]
    fn test_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();

        assert!(store.load(&key(1)).unwrap().is_none());

        store.save(&key(1), &json!({"weights": [1.0, 2.0]})).unwrap();
        assert_eq!(
            store.load(&key(1)).unwrap(),
            Some(json!({"weights": [1.0, 2.0]}))
        );
        assert!(store.load(&key(2)).unwrap().is_none());

        // Names are sanitised into a single directory level.
        assert!(dir.path().join("train_surrogate").is_dir());

        assert!(store.remove(&key(1)).unwrap());
        assert!(!store.remove(&key(1)).unwrap());
        assert!(store.load(&key(1)).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).unwrap();
        store.save(&key(3), &json!(1)).unwrap();

        let path = store.entry_path(&key(3));
        fs::write(&path, b"{not json").unwrap();
        assert!(store.load(&key(3)).is_err());
    }
}
