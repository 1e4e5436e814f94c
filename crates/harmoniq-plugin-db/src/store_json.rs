use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::PluginDescription;
use crate::KnownPluginList;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read plugin database: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse plugin database: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonStoreData {
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    plugins: Vec<PluginDescription>,
    #[serde(default)]
    blacklist: Vec<String>,
}

/// Known plugin list persisted as JSON between runs.
#[derive(Debug)]
pub struct PluginStore {
    path: PathBuf,
    data: Mutex<JsonStoreData>,
}

impl PluginStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            JsonStoreData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let mut config_dir = config_dir()?;
        config_dir.push("plugins.json");
        Ok(config_dir)
    }

    /// File recording the plugin currently being scanned, next to the store.
    pub fn dead_mans_pedal_path(&self) -> PathBuf {
        self.path.with_file_name("scan-in-progress.txt")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.data.lock().saved_at
    }

    pub fn plugins(&self) -> Vec<PluginDescription> {
        self.data.lock().plugins.clone()
    }

    /// Copies the stored descriptions and blacklist into `list`.
    pub fn load_into(&self, list: &mut KnownPluginList) {
        let data = self.data.lock();
        for plugin in &data.plugins {
            list.add_type(plugin.clone());
        }
        for locator in &data.blacklist {
            list.add_to_blacklist(locator.clone());
        }
    }

    pub fn save(&self, list: &KnownPluginList) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.plugins = list.types().to_vec();
        data.plugins.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.identifier().cmp(&b.identifier()))
        });
        data.blacklist = list.blacklist().map(str::to_owned).collect();
        data.saved_at = Some(Utc::now());
        self.persist_locked(&data)
    }

    fn persist_locked(&self, data: &JsonStoreData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Harmoniq's per-user configuration directory, created on demand.
pub fn config_dir() -> Result<PathBuf, StoreError> {
    let mut config_dir = dirs::config_dir().ok_or_else(|| {
        StoreError::Read(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no config directory",
        ))
    })?;
    config_dir.push("HarmoniqStudio");
    fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}
