//! Persistent key/value configuration store.
//!
//! Every value is a string. Reads return the stored value or a caller
//! supplied default; writes are serialized and run registered action hooks
//! around the change:
//!
//! 1. `before` hooks see the old and the new value
//! 2. the new value is published (and persisted)
//! 3. `after` hooks see the new value
//!
//! Hooks never observe a half-applied write. The store is persisted as a flat
//! TOML table and is merged over a set of init defaults when opened.

use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

/// Configuration store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read config store '{0}': {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config store '{0}': {1}")]
    Parse(PathBuf, #[source] toml::de::Error),
    #[error("failed to write config store '{0}': {1}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("failed to encode config store: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Hook invoked around configuration reads and writes.
///
/// All methods have empty defaults so an action only implements the events
/// it cares about. Hooks must not write to the store they are registered on.
pub trait ConfigAction: Send + Sync {
    /// Called before `key` changes from `old` to `new`.
    fn before(&self, _key: &str, _old: Option<&str>, _new: &str) {}

    /// Called after `key` was set to `value`.
    fn after(&self, _key: &str, _value: &str) {}

    /// Called on every read of `key`.
    fn on_read(&self, _key: &str, _value: Option<&str>) {}
}

/// Thread-safe configuration store.
pub struct ConfigStore {
    path: Option<PathBuf>,
    values: RwLock<BTreeMap<String, String>>,
    removed: BTreeMap<String, String>,
    actions: RwLock<BTreeMap<String, Arc<dyn ConfigAction>>>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Create a store that lives in memory only.
    pub fn in_memory(init: BTreeMap<String, String>) -> Self {
        Self {
            path: None,
            values: RwLock::new(init),
            removed: BTreeMap::new(),
            actions: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the store persisted at `path`, merged over `init`.
    ///
    /// Persisted keys that are not part of `init` are moved to the
    /// [`removed`](Self::removed) map. An empty `init` keeps every persisted
    /// key. The merged result is written back immediately, so the file is
    /// created on first start.
    pub fn open(path: impl Into<PathBuf>, init: BTreeMap<String, String>) -> Result<Self, StoreError> {
        let path = path.into();
        let persisted = load_map(&path)?;

        let mut values = init;
        let mut removed = BTreeMap::new();
        let keep_all = values.is_empty();
        for (key, value) in persisted {
            if keep_all || values.contains_key(&key) {
                values.insert(key, value);
            } else {
                removed.insert(key, value);
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Dropped config keys unknown to init settings");
        }

        let store = Self {
            path: Some(path),
            values: RwLock::new(values),
            removed,
            actions: RwLock::new(BTreeMap::new()),
            write_lock: Mutex::new(()),
        };
        store.save()?;
        Ok(store)
    }

    /// Path of the persisted file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Register (or replace) a named action hook.
    pub fn add_action(&self, name: impl Into<String>, action: Arc<dyn ConfigAction>) {
        self.actions.write().insert(name.into(), action);
    }

    /// Unregister a named action hook.
    pub fn remove_action(&self, name: &str) -> bool {
        self.actions.write().remove(name).is_some()
    }

    fn action_list(&self) -> Vec<Arc<dyn ConfigAction>> {
        self.actions.read().values().cloned().collect()
    }

    /// Get the value of `key` or `default` when absent.
    pub fn get(&self, key: &str, default: &str) -> String {
        let value = self.values.read().get(key).cloned();
        for action in self.action_list() {
            action.on_read(key, value.as_deref());
        }
        value.unwrap_or_else(|| default.to_string())
    }

    /// Get the value of `key` if present.
    pub fn get_opt(&self, key: &str) -> Option<String> {
        let value = self.values.read().get(key).cloned();
        for action in self.action_list() {
            action.on_read(key, value.as_deref());
        }
        value
    }

    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        self.get(key, "").trim().parse().unwrap_or(default)
    }

    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.get(key, "").trim().parse().unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        self.get(key, "").trim().parse().unwrap_or(default)
    }

    /// Boolean values: only `true` (case-insensitive) is true.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_opt(key) {
            Some(v) => v.trim().eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.read().contains_key(key)
    }

    /// Set `key` to `value`, running action hooks around the change.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let _guard = self.write_lock.lock();

        let old = self.values.read().get(key).cloned();
        let actions = self.action_list();
        for action in &actions {
            action.before(key, old.as_deref(), &value);
        }

        let changed = old.as_deref() != Some(value.as_str());
        self.values.write().insert(key.to_string(), value.clone());
        if changed {
            debug!(key, value = %value, "Config value changed");
            if let Err(e) = self.save() {
                error!(error = %e, "Cannot persist config store");
            }
        }

        for action in &actions {
            action.after(key, &value);
        }
    }

    pub fn set_long(&self, key: &str, value: i64) {
        self.set(key, value.to_string());
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    /// Set several values at once. Each write runs the hooks individually.
    pub fn set_all(&self, values: &BTreeMap<String, String>) {
        for (key, value) in values {
            self.set(key, value.clone());
        }
    }

    /// Remove `key`. No hooks run.
    pub fn remove(&self, key: &str) -> Option<String> {
        let _guard = self.write_lock.lock();
        let old = self.values.write().remove(key);
        if old.is_some() {
            if let Err(e) = self.save() {
                error!(error = %e, "Cannot persist config store");
            }
        }
        old
    }

    /// All keys currently set.
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    /// Keys dropped while merging the persisted file over the init settings.
    pub fn removed(&self) -> &BTreeMap<String, String> {
        &self.removed
    }

    /// Snapshot of the whole store.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.read().clone()
    }

    fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        let encoded = toml::to_string(&snapshot)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Write(path.clone(), e))?;
            }
        }
        std::fs::write(path, encoded).map_err(|e| StoreError::Write(path.clone(), e))
    }
}

fn load_map(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let contents =
        std::fs::read_to_string(path).map_err(|e| StoreError::Read(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| StoreError::Parse(path.to_path_buf(), e))
}
