//! Durable key-value persistence seam
//!
//! Rate-limit windows and the offline queue persist through this interface.
//! All implementations are best-effort: a store that cannot read or write
//! (quota exceeded, disk gone) degrades to whatever in-memory state the
//! caller keeps, it never fails the operation that touched it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Generic durable key-value storage
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if absent or unreadable
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, silently dropping it if the store is unavailable
    fn set(&self, key: &str, value: &str);

    /// Remove a value
    fn remove(&self, key: &str);
}

/// In-memory store, the degraded-mode and test implementation
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// File-backed store holding one JSON object per file
///
/// Writes go through a sibling temp file and a rename so a crash mid-write
/// leaves the previous snapshot intact.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) a store at the given path
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let cache = Self::load(&path).unwrap_or_default();
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    fn load(path: &Path) -> Option<HashMap<String, String>> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn flush(&self, entries: &HashMap<String, String>) {
        let serialized = match serde_json::to_string(entries) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("storage serialize failed for {}: {e}", self.path.display());
                return;
            }
        };
        let tmp = self.path.with_extension("tmp");
        if let Err(e) =
            std::fs::write(&tmp, serialized).and_then(|_| std::fs::rename(&tmp, &self.path))
        {
            log::warn!("storage write failed for {}: {e}", self.path.display());
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), value.to_string());
            self.flush(&cache);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
            self.flush(&cache);
        }
    }
}
