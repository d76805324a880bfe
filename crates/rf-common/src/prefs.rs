//! Host preference storage
//!
//! The SDK keeps two identity strings in host preferences: the anonymous id
//! assigned on first launch and the user id set by `identify`. The queue core
//! never touches these; they sit behind [`PreferenceStore`] so the SDK layer
//! and tests can inject whatever backing they need.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

/// Preference key for the generated anonymous id.
pub const ANONYMOUS_ID_KEY: &str = "__revflowAnonymousId";

/// Preference key for the identified user id.
pub const USER_ID_KEY: &str = "__revflowUserId";

/// String key-value storage with host-preference semantics.
///
/// Implementations must be safe for concurrent access.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// In-memory store for tests and hosts without persistent preferences.
#[derive(Default)]
pub struct MemoryPreferences {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

/// JSON-file-backed store.
///
/// The whole map is rewritten on every mutation; preference writes are rare
/// (identity changes only). Write failures are logged, never surfaced:
/// losing a preference write must not break the host app.
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FilePreferences {
    /// Open the store at `path`, loading any existing contents. A missing
    /// file starts empty; a corrupt file is discarded with a warning.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Discarding unreadable preference file");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &HashMap<String, String>) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let raw = serde_json::to_string_pretty(values)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            std::fs::write(&self.path, raw)
        };
        if let Err(e) = write() {
            warn!(path = %self.path.display(), error = %e, "Failed to persist preferences");
        }
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock();
        values.insert(key.to_string(), value.to_string());
        self.persist(&values);
    }

    fn remove(&self, key: &str) {
        let mut values = self.values.lock();
        if values.remove(key).is_some() {
            self.persist(&values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_roundtrip() {
        let prefs = MemoryPreferences::new();
        assert!(prefs.get(ANONYMOUS_ID_KEY).is_none());

        prefs.set(ANONYMOUS_ID_KEY, "anon-42");
        assert_eq!(prefs.get(ANONYMOUS_ID_KEY).as_deref(), Some("anon-42"));

        prefs.remove(ANONYMOUS_ID_KEY);
        assert!(prefs.get(ANONYMOUS_ID_KEY).is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");

        let prefs = FilePreferences::open(&path);
        prefs.set(USER_ID_KEY, "user-7");
        prefs.set(ANONYMOUS_ID_KEY, "anon-7");
        drop(prefs);

        let reopened = FilePreferences::open(&path);
        assert_eq!(reopened.get(USER_ID_KEY).as_deref(), Some("user-7"));
        assert_eq!(reopened.get(ANONYMOUS_ID_KEY).as_deref(), Some("anon-7"));
    }

    #[test]
    fn test_file_store_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "not json at all").unwrap();

        let prefs = FilePreferences::open(&path);
        assert!(prefs.get(USER_ID_KEY).is_none());
        prefs.set(USER_ID_KEY, "fresh");
        assert_eq!(prefs.get(USER_ID_KEY).as_deref(), Some("fresh"));
    }
}
