//! Host-installed flag overrides.
//!
//! An override short-circuits evaluation entirely (no impression is emitted
//! for an overridden read) and survives restarts through the storage
//! collaborator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::warn;

use crate::storage::StorageEntry;

#[derive(Default)]
pub struct FlagOverrides {
    values: RwLock<HashMap<String, String>>,
    entry: Mutex<Option<Arc<dyn StorageEntry>>>,
}

impl FlagOverrides {
    pub fn new() -> FlagOverrides {
        FlagOverrides::default()
    }

    /// Binds the persistence entry and loads previously persisted overrides.
    /// Values set before setup stay and win over persisted ones.
    pub fn attach_storage(&self, entry: Arc<dyn StorageEntry>) {
        if let Some(data) = entry.read() {
            match serde_json::from_str::<HashMap<String, String>>(&data) {
                Ok(persisted) => {
                    let mut values = self.values.write().unwrap();
                    for (name, value) in persisted {
                        values.entry(name).or_insert(value);
                    }
                }
                Err(e) => warn!(error = %e, "discarding unreadable overrides entry"),
            }
        }
        *self.entry.lock().unwrap() = Some(entry);
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.read().unwrap().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.read().unwrap().get(name).cloned()
    }

    pub fn set(&self, name: &str, value: &str) {
        self.values
            .write()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        self.persist();
    }

    pub fn clear(&self, name: &str) {
        self.values.write().unwrap().remove(name);
        self.persist();
    }

    pub fn clear_all(&self) {
        self.values.write().unwrap().clear();
        self.persist();
    }

    fn persist(&self) {
        let entry = self.entry.lock().unwrap();
        let Some(entry) = entry.as_ref() else {
            return;
        };
        let values = self.values.read().unwrap();
        match serde_json::to_string(&*values) {
            Ok(data) => entry.write(&data),
            Err(e) => warn!(error = %e, "failed to serialize overrides"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, Storage};

    #[test]
    fn set_get_has_clear() {
        let overrides = FlagOverrides::new();
        assert!(!overrides.has("demo.int"));
        overrides.set("demo.int", "7");
        assert!(overrides.has("demo.int"));
        assert_eq!(overrides.get("demo.int").as_deref(), Some("7"));
        overrides.clear("demo.int");
        assert!(!overrides.has("demo.int"));
    }

    #[test]
    fn clear_all_empties_the_map() {
        let overrides = FlagOverrides::new();
        overrides.set("a", "1");
        overrides.set("b", "2");
        overrides.clear_all();
        assert!(!overrides.has("a"));
        assert!(!overrides.has("b"));
    }

    #[test]
    fn overrides_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path());
            let overrides = FlagOverrides::new();
            overrides.attach_storage(storage.entry("overrides"));
            overrides.set("demo.flag", "true");
        }
        let storage = FileStorage::new(dir.path());
        let overrides = FlagOverrides::new();
        overrides.attach_storage(storage.entry("overrides"));
        assert_eq!(overrides.get("demo.flag").as_deref(), Some("true"));
    }

    #[test]
    fn pre_setup_values_win_over_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.entry("overrides").write(r#"{"demo.flag":"false"}"#);

        let overrides = FlagOverrides::new();
        overrides.set("demo.flag", "true");
        overrides.attach_storage(storage.entry("overrides"));
        assert_eq!(overrides.get("demo.flag").as_deref(), Some("true"));
    }
}
