use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no config directory available")]
    NoConfigDir,
}

type ChangeListener = Arc<dyn Fn(&SettingsStore) + Send + Sync>;

/// Key-value user settings shared across the host, with change
/// notifications.
pub struct SettingsStore {
    path: Option<PathBuf>,
    values: RwLock<BTreeMap<String, Value>>,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    next_listener: AtomicU64,
}

impl SettingsStore {
    /// Store that is never written to disk.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::with_values(None, BTreeMap::new()))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>, SettingsError> {
        let path = path.into();
        let values = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            BTreeMap::new()
        };
        Ok(Arc::new(Self::with_values(Some(path), values)))
    }

    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let mut base = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        base.push("HarmoniqStudio");
        fs::create_dir_all(&base)?;
        base.push("scanner-settings.json");
        Ok(base)
    }

    fn with_values(path: Option<PathBuf>, values: BTreeMap<String, Value>) -> Self {
        Self {
            path,
            values: RwLock::new(values),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.values.read().get(key).and_then(Value::as_i64)
    }

    pub fn int_value(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    /// Stores `value`, persists the file and notifies subscribers when the
    /// value actually changed. If the file cannot be written the previous
    /// value is restored and nobody is notified.
    pub fn set_value(&self, key: &str, value: impl Into<Value>) -> Result<(), SettingsError> {
        let value = value.into();
        let previous = {
            let mut values = self.values.write();
            if values.get(key) == Some(&value) {
                return Ok(());
            }
            values.insert(key.to_string(), value)
        };
        self.commit(key, previous)
    }

    pub fn remove(&self, key: &str) -> Result<(), SettingsError> {
        let previous = self.values.write().remove(key);
        if previous.is_none() {
            return Ok(());
        }
        self.commit(key, previous)
    }

    fn commit(&self, key: &str, previous: Option<Value>) -> Result<(), SettingsError> {
        if let Err(err) = self.save() {
            let mut values = self.values.write();
            match previous {
                Some(previous) => values.insert(key.to_string(), previous),
                None => values.remove(key),
            };
            return Err(err);
        }
        self.notify();
        Ok(())
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(&*self.values.read())?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Registers `listener` for change notifications until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&SettingsStore) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        debug!(id, "settings listener added");
        Subscription {
            store: Arc::downgrade(self),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.lock().retain(|(existing, _)| *existing != id);
        debug!(id, "settings listener removed");
    }

    fn notify(&self) {
        // Listeners may call back into the store, so run them unlocked.
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(self);
        }
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("path", &self.path)
            .field("values", &*self.values.read())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Keeps a settings listener registered; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
#[derive(Debug)]
pub struct Subscription {
    store: Weak<SettingsStore>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}
