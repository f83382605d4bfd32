//! Key-value settings seam.
//!
//! The application's persistent settings store is outside this subsystem;
//! the updater only needs string get/set for the server URL, the cached
//! client id and the resource-sync bookkeeping, so that is the whole trait.

use log::warn;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// JSON-file backed store used by the binaries and tests.
///
/// Writes go through a sibling temp file and a rename so a crash mid-save
/// never truncates the settings file. Persistence failures are logged and
/// swallowed: losing a cached value degrades analytics, not functionality.
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileSettings {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &Map<String, Value>) {
        let tmp = self.path.with_extension("json.tmp");
        let payload = match serde_json::to_string_pretty(&Value::Object(values.clone())) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize settings: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(&tmp, payload) {
            warn!("Failed to write settings temp file {}: {e}", tmp.display());
            return;
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            warn!("Failed to replace settings file {}: {e}", self.path.display());
            let _ = std::fs::remove_file(&tmp);
        }
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.get(key).and_then(|v| v.as_str()).map(str::to_owned)
    }

    fn set(&self, key: &str, value: &str) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_owned(), Value::String(value.to_owned()));
        self.save(&values);
    }
}
