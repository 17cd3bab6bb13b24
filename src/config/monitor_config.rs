use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::constants::{
    MONITOR_INITIAL_DELAY_SECS, MONITOR_INTERVAL_SECS, MONITOR_PROBE_DELAY_MS,
    MONITOR_PROBE_TIMEOUT_SECS,
};
use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "monitor_config.json";

/// Connection monitor timings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub check_interval_secs: u64,
    /// Delay before the first reconciliation after monitoring starts
    pub initial_delay_secs: u64,
    /// Pause between two probes of one pass
    pub probe_delay_ms: u64,
    pub probe_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            check_interval_secs: MONITOR_INTERVAL_SECS,
            initial_delay_secs: MONITOR_INITIAL_DELAY_SECS,
            probe_delay_ms: MONITOR_PROBE_DELAY_MS,
            probe_timeout_secs: MONITOR_PROBE_TIMEOUT_SECS,
        }
    }
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        if !file_path.exists() {
            warn!("Monitor config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_str(&fs::read_to_string(&file_path).await?)?;
        info!("Monitor config loaded from {:?}", file_path);
        Ok(config)
    }

    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        fs::write(&file_path, serde_json::to_string_pretty(&self)?).await?;
        info!("Monitor config saved to {:?}", file_path);
        Ok(())
    }
}
