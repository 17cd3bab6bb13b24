//! Smart-socket device records and the local registry holding them.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::protocol::PowerTelemetry;
use crate::storage::StateCache;

/// Externally visible state of one smart socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceRecord {
    /// Local record id
    pub id: String,
    pub name: String,
    /// Radio identity used to reach the device
    pub device_id: String,
    pub connected: bool,
    pub power_on: bool,
    pub mode: u8,
    /// Palette index sent with `SET_LED`
    pub indicator_color: u8,
    /// Percent, 0 to 100
    pub indicator_brightness: u8,
    /// Minutes until automatic switch-off, 0 when disabled
    pub delay_off_minutes: u32,
    pub animation: u8,
    pub version: String,
    pub serial_number: String,
    pub power: Option<PowerTelemetry>,
    pub last_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            device_id: String::new(),
            connected: false,
            power_on: false,
            mode: 1,
            indicator_color: 0,
            indicator_brightness: 80,
            delay_off_minutes: 0,
            animation: 0,
            version: "1.0.0".to_string(),
            serial_number: String::new(),
            power: None,
            last_message: None,
            updated_at: None,
        }
    }
}

#[derive(Default)]
struct Registry {
    devices: Vec<DeviceRecord>,
    current: Option<String>,
}

/// Local device list. Every connected-flag change is written through to the state cache.
pub struct DeviceStore {
    registry: Mutex<Registry>,
    cache: Arc<dyn StateCache>,
}

impl DeviceStore {
    pub fn new(cache: Arc<dyn StateCache>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            cache,
        }
    }

    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> Option<R> {
        self.registry.lock().ok().map(|mut registry| f(&mut registry))
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.with_registry(|r| r.devices.clone()).unwrap_or_default()
    }

    pub fn identities(&self) -> Vec<String> {
        self.with_registry(|r| r.devices.iter().map(|d| d.device_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn find(&self, device_id: &str) -> Option<DeviceRecord> {
        self.with_registry(|r| r.devices.iter().find(|d| d.device_id == device_id).cloned())
            .flatten()
    }

    /// Marks an existing record connected, or creates one with default settings.
    /// Either way the record becomes the current device.
    pub fn add_and_connect(
        &self,
        device_id: &str,
        name: Option<&str>,
        serial_number: Option<&str>,
    ) -> Option<DeviceRecord> {
        let record = self.with_registry(|r| {
            let index = match r.devices.iter().position(|d| d.device_id == device_id) {
                Some(index) => {
                    debug!("Device {} already known, marking connected", device_id);
                    index
                }
                None => {
                    let now = Utc::now();
                    let record = DeviceRecord {
                        id: format!("device-{}", now.timestamp_millis()),
                        name: name
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("Smart socket {}", r.devices.len() + 1)),
                        device_id: device_id.to_string(),
                        serial_number: serial_number
                            .map(str::to_string)
                            .unwrap_or_else(|| {
                                format!("SN{:08}", now.timestamp_millis() % 100_000_000)
                            }),
                        updated_at: Some(now),
                        ..Default::default()
                    };
                    info!("Adding device {} ({})", record.name, device_id);
                    r.devices.push(record);
                    r.devices.len() - 1
                }
            };
            r.devices[index].connected = true;
            r.current = Some(device_id.to_string());
            r.devices[index].clone()
        })?;
        self.cache.set_connected(device_id, true);
        Some(record)
    }

    /// Returns whether the flag actually changed. Unknown identities are ignored.
    pub fn update_status(&self, device_id: &str, connected: bool) -> bool {
        let changed = self
            .with_registry(|r| {
                r.devices
                    .iter_mut()
                    .find(|d| d.device_id == device_id)
                    .map(|d| std::mem::replace(&mut d.connected, connected) != connected)
            })
            .flatten();
        match changed {
            Some(changed) => {
                self.cache.set_connected(device_id, connected);
                changed
            }
            None => false,
        }
    }

    /// Applies a settings change and stamps the record.
    pub fn update(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DeviceRecord),
    ) -> Option<DeviceRecord> {
        self.with_registry(|r| {
            r.devices.iter_mut().find(|d| d.device_id == device_id).map(|d| {
                f(d);
                d.updated_at = Some(Utc::now());
                d.clone()
            })
        })
        .flatten()
    }

    pub fn record_telemetry(
        &self,
        device_id: &str,
        power: Option<PowerTelemetry>,
        last_message: &str,
    ) -> Option<DeviceRecord> {
        self.with_registry(|r| {
            r.devices.iter_mut().find(|d| d.device_id == device_id).map(|d| {
                if power.is_some() {
                    d.power = power;
                }
                d.last_message = Some(last_message.to_string());
                d.clone()
            })
        })
        .flatten()
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceRecord> {
        let removed = self
            .with_registry(|r| {
                let index = r.devices.iter().position(|d| d.device_id == device_id)?;
                if r.current.as_deref() == Some(device_id) {
                    r.current = None;
                }
                Some(r.devices.remove(index))
            })
            .flatten();
        if removed.is_some() {
            self.cache.remove(device_id);
        }
        removed
    }

    /// Moves a record, its cached flag and the current pointer to a new radio
    /// identity. Refused when another record already uses `new_id`.
    pub fn rename(&self, old_id: &str, new_id: &str) -> Option<DeviceRecord> {
        let record = self
            .with_registry(|r| {
                if r.devices.iter().any(|d| d.device_id == new_id) {
                    return None;
                }
                let record = r.devices.iter_mut().find(|d| d.device_id == old_id)?;
                record.device_id = new_id.to_string();
                record.updated_at = Some(Utc::now());
                let record = record.clone();
                if r.current.as_deref() == Some(old_id) {
                    r.current = Some(new_id.to_string());
                }
                Some(record)
            })
            .flatten()?;
        let connected = self.cache.connected(old_id).unwrap_or(record.connected);
        self.cache.remove(old_id);
        self.cache.set_connected(new_id, connected);
        info!("Device {} renamed to {}", old_id, new_id);
        Some(record)
    }

    pub fn current(&self) -> Option<DeviceRecord> {
        self.with_registry(|r| {
            let current = r.current.as_deref()?;
            r.devices.iter().find(|d| d.device_id == current).cloned()
        })
        .flatten()
    }

    /// Replaces the list with remote records. Connected flags are not trusted from
    /// the remote side; they come back from the local cache, unknown meaning offline.
    pub fn replace_all(&self, records: Vec<DeviceRecord>) {
        let records: Vec<DeviceRecord> = records
            .into_iter()
            .map(|mut record| {
                record.connected = self.cache.connected(&record.device_id).unwrap_or(false);
                record
            })
            .collect();
        info!("Loaded {} devices from the remote store", records.len());
        self.with_registry(|r| {
            if let Some(current) = &r.current {
                if !records.iter().any(|d| &d.device_id == current) {
                    r.current = None;
                }
            }
            r.devices = records;
        });
    }
}
