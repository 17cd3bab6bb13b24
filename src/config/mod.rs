pub mod bluetooth_config;
pub mod monitor_config;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub use crate::config::bluetooth_config::BluetoothConfig;
pub use crate::config::monitor_config::MonitorConfig;
use crate::utils::ensure_directory_exists;

const APP_DIR_NAME: &str = "smart-socket";
const SYNC_CONFIG_FILE_NAME: &str = "sync_config.json";

/// Identity used when talking to the remote record store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub owner_id: String,
}

impl SyncConfig {
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(SYNC_CONFIG_FILE_NAME);
        if !file_path.exists() {
            warn!("Sync config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(&fs::read_to_string(&file_path).await?)?;
        info!("Sync config loaded from {:?}", file_path);
        Ok(config)
    }

    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;
        let file_path = config_dir.join(SYNC_CONFIG_FILE_NAME);
        fs::write(&file_path, serde_json::to_string_pretty(&self)?).await?;
        info!("Sync config saved to {:?}", file_path);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub bluetooth: BluetoothConfig,
    pub monitor: MonitorConfig,
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Per-user configuration directory of the application.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or_else(|| anyhow!("no configuration directory on this platform"))
    }

    /// Loads every section; a section that fails to parse falls back to its defaults.
    pub async fn load(config_dir: &Path) -> Self {
        let bluetooth = BluetoothConfig::load_config(config_dir).await.unwrap_or_else(|e| {
            error!("Failed to load bluetooth config, using default: {}", e);
            BluetoothConfig::default()
        });
        let monitor = MonitorConfig::load_config(config_dir).await.unwrap_or_else(|e| {
            error!("Failed to load monitor config, using default: {}", e);
            MonitorConfig::default()
        });
        let sync = SyncConfig::load_config(config_dir).await.unwrap_or_else(|e| {
            error!("Failed to load sync config, using default: {}", e);
            SyncConfig::default()
        });
        Self {
            bluetooth,
            monitor,
            sync,
        }
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.bluetooth.save_config(config_dir).await?;
        self.monitor.save_config(config_dir).await?;
        self.sync.save_config(config_dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_files_give_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path()).await;
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.bluetooth.device_name_filters, vec!["ai-thinker".to_string()]);
        assert_eq!(config.monitor.check_interval_secs, 60);
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested");
        let mut config = AppConfig::default();
        config.bluetooth.max_connect_retries = 5;
        config.sync.owner_id = "owner-1".into();

        config.save(&target).await.unwrap();

        assert_eq!(AppConfig::load(&target).await, config);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("bluetooth_config.json"),
            r#"{"preferred_mtu": 185}"#,
        )
        .await
        .unwrap();

        let config = BluetoothConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(config.preferred_mtu, 185);
        assert_eq!(config.search_timeout_secs, 30);
    }

    #[tokio::test]
    async fn broken_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("monitor_config.json"), "{not json")
            .await
            .unwrap();
        assert_eq!(AppConfig::load(dir.path()).await.monitor, MonitorConfig::default());
    }
}
