//! Local cache of the last known connected flag per device identity.
//!
//! Reads and writes are synchronous; the data is a handful of booleans and
//! must be available before the first reconciliation runs after a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use log::{error, info, warn};

pub trait StateCache: Send + Sync {
    fn connected(&self, device_id: &str) -> Option<bool>;
    fn set_connected(&self, device_id: &str, connected: bool);
    fn remove(&self, device_id: &str);
}

/// Volatile cache, used by tests and when no data directory is available.
#[derive(Default)]
pub struct MemoryStateCache {
    flags: Mutex<HashMap<String, bool>>,
}

impl StateCache for MemoryStateCache {
    fn connected(&self, device_id: &str) -> Option<bool> {
        self.flags.lock().ok()?.get(device_id).copied()
    }

    fn set_connected(&self, device_id: &str, connected: bool) {
        if let Ok(mut flags) = self.flags.lock() {
            flags.insert(device_id.to_string(), connected);
        }
    }

    fn remove(&self, device_id: &str) {
        if let Ok(mut flags) = self.flags.lock() {
            flags.remove(device_id);
        }
    }
}

/// JSON map `{identity: connected}` persisted to one file.
pub struct JsonFileStateCache {
    path: PathBuf,
    flags: Mutex<HashMap<String, bool>>,
}

impl JsonFileStateCache {
    pub const FILE_NAME: &'static str = "connection_state.json";

    /// Opens the cache in `dir`. A missing or unreadable file starts empty.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        let flags = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Ignoring corrupt connection state cache {:?}: {}", path, e);
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        info!("Connection state cache at {:?} ({} entries)", path, flags.len());
        Ok(Self {
            path,
            flags: Mutex::new(flags),
        })
    }

    fn persist(&self, flags: &HashMap<String, bool>) {
        let result = serde_json::to_string_pretty(flags)
            .map_err(anyhow::Error::from)
            .and_then(|json| fs::write(&self.path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            error!("Failed to write connection state cache {:?}: {}", self.path, e);
        }
    }
}

impl StateCache for JsonFileStateCache {
    fn connected(&self, device_id: &str) -> Option<bool> {
        self.flags.lock().ok()?.get(device_id).copied()
    }

    fn set_connected(&self, device_id: &str, connected: bool) {
        if let Ok(mut flags) = self.flags.lock() {
            if flags.insert(device_id.to_string(), connected) != Some(connected) {
                self.persist(&flags);
            }
        }
    }

    fn remove(&self, device_id: &str) {
        if let Ok(mut flags) = self.flags.lock() {
            if flags.remove(device_id).is_some() {
                self.persist(&flags);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = JsonFileStateCache::open(dir.path()).unwrap();
            cache.set_connected("AA:BB", true);
            cache.set_connected("CC:DD", false);
            cache.remove("CC:DD");
        }
        let cache = JsonFileStateCache::open(dir.path()).unwrap();
        assert_eq!(cache.connected("AA:BB"), Some(true));
        assert_eq!(cache.connected("CC:DD"), None);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(JsonFileStateCache::FILE_NAME), "[1,2").unwrap();
        let cache = JsonFileStateCache::open(dir.path()).unwrap();
        assert_eq!(cache.connected("AA:BB"), None);
    }
}
