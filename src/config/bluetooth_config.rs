use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::constants::{
    ADAPTER_SETTLE_DELAY_MS, COMMAND_DELAY_MS, CONNECT_RETRY_DELAY_MS, CONNECT_TIMEOUT_SECS,
    DEFAULT_SEARCH_TIMEOUT_SECS, DEVICE_FAMILY_NAME, MAX_CONNECT_RETRIES, PREFERRED_MTU,
    RECEIVE_HISTORY_LIMIT, SCAN_PAIR_TIMEOUT_SECS,
};
use crate::core::bluetooth::types::ScanOptions;
use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "bluetooth_config.json";

/// Radio, discovery and connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Case-insensitive name fragments an advertiser must carry to be listed
    pub device_name_filters: Vec<String>,
    pub allow_duplicates: bool,
    /// Minimum spacing between reports for one device; 0 reports every one
    pub scan_interval_ms: u64,
    /// How long a reconnect waits for the device to show up
    pub search_timeout_secs: u64,
    /// How long pairing from a scanned code waits for the device to show up
    pub scan_pair_timeout_secs: u64,
    /// Pause between adapter close and reopen during a reset
    pub settle_delay_ms: u64,
    pub connect_timeout_secs: u64,
    /// Total connection attempts before giving up
    pub max_connect_retries: u32,
    pub connect_retry_delay_ms: u64,
    pub preferred_mtu: u16,
    pub command_delay_ms: u64,
    pub receive_history_limit: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            device_name_filters: vec![DEVICE_FAMILY_NAME.to_string()],
            allow_duplicates: false,
            scan_interval_ms: 0,
            search_timeout_secs: DEFAULT_SEARCH_TIMEOUT_SECS,
            scan_pair_timeout_secs: SCAN_PAIR_TIMEOUT_SECS,
            settle_delay_ms: ADAPTER_SETTLE_DELAY_MS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            max_connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            preferred_mtu: PREFERRED_MTU,
            command_delay_ms: COMMAND_DELAY_MS,
            receive_history_limit: RECEIVE_HISTORY_LIMIT,
        }
    }
}

impl BluetoothConfig {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            allow_duplicates: self.allow_duplicates,
            interval: Duration::from_millis(self.scan_interval_ms),
            services: Vec::new(),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn scan_pair_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_pair_timeout_secs)
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    /// Loads the config from a configuration file.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        if !file_path.exists() {
            warn!(
                "Bluetooth config file not found at {:?}, using default.",
                file_path
            );
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(&file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Bluetooth config loaded from {:?}", file_path);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;
        let file_path = config_dir.join(CONFIG_FILE_NAME);

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize bluetooth config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(&file_path, config_json).await?;
        info!("Bluetooth config saved to {:?}", file_path);
        Ok(())
    }
}
