//! On-disk key/value storage collaborator.
//!
//! The engine persists a handful of string-keyed JSON entries (the last
//! accepted configuration, the overrides map, the device identity) through
//! this interface. Durability is best-effort: IO failures are logged and
//! swallowed, never propagated into the evaluation path.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

/// A single named entry in the backing store.
pub trait StorageEntry: Send + Sync {
    fn name(&self) -> &str;
    fn read(&self) -> Option<String>;
    fn write(&self, data: &str);
    fn delete(&self);
}

/// The backing store. One entry per name; entries are independent.
pub trait Storage: Send + Sync {
    fn entry(&self, name: &str) -> Arc<dyn StorageEntry>;
}

/// Default backend: one JSON file per entry under a configured directory.
pub struct FileStorage {
    location: PathBuf,
}

impl FileStorage {
    pub fn new(location: impl Into<PathBuf>) -> FileStorage {
        FileStorage {
            location: location.into(),
        }
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        FileStorage::new(std::env::temp_dir().join("rox").join("storage"))
    }
}

impl Storage for FileStorage {
    fn entry(&self, name: &str) -> Arc<dyn StorageEntry> {
        Arc::new(FileStorageEntry {
            name: name.to_string(),
            path: self.location.join(format!("{name}.json")),
        })
    }
}

struct FileStorageEntry {
    name: String,
    path: PathBuf,
}

impl StorageEntry for FileStorageEntry {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }

    fn write(&self, data: &str) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(entry = %self.name, error = %e, "failed to create storage location");
                return;
            }
        }
        if let Err(e) = fs::write(&self.path, data) {
            warn!(entry = %self.name, path = %self.path.display(), error = %e,
                "failed to write storage entry");
        }
    }

    fn delete(&self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(entry = %self.name, error = %e, "failed to delete storage entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entries_as_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let entry = storage.entry("overrides");

        assert_eq!(entry.read(), None);
        entry.write(r#"{"a":"1"}"#);
        assert_eq!(entry.read().as_deref(), Some(r#"{"a":"1"}"#));
        assert!(dir.path().join("overrides.json").exists());

        entry.delete();
        assert_eq!(entry.read(), None);
        // Deleting a missing entry is a no-op.
        entry.delete();
    }

    #[test]
    fn entries_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.entry("one").write("1");
        storage.entry("two").write("2");
        assert_eq!(storage.entry("one").read().as_deref(), Some("1"));
        assert_eq!(storage.entry("two").read().as_deref(), Some("2"));
    }
}
