//! Defines shared data structures for the Bluetooth module.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Radio adapter state as reported by the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterState {
    /// The radio is powered and usable
    pub available: bool,
    /// Advertisement discovery is running
    pub discovering: bool,
}

/// A single advertisement as reported by the platform
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Platform-assigned, scan-session-scoped identifier
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    /// Manufacturer payload, company identifier first (little endian)
    pub raw: Vec<u8>,
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    /// Opaque platform identity; unique inside one scan session
    pub id: String,
    /// The advertised name of the device
    pub name: String,
    /// The signal strength (RSSI) of the last advertisement
    pub rssi: i16,
    /// Service UUIDs carried by the advertisement
    pub advertised_services: BTreeSet<Uuid>,
    /// Raw advertisement payload
    pub advertisement: Vec<u8>,
}

impl DiscoveredDevice {
    pub fn from_advertisement(advertisement: &Advertisement) -> Self {
        Self {
            id: advertisement.id.clone(),
            name: advertisement.name.clone().unwrap_or_default(),
            rssi: advertisement.rssi.unwrap_or_default(),
            advertised_services: advertisement.services.iter().copied().collect(),
            advertisement: advertisement.raw.clone(),
        }
    }

    /// Refreshes the advertisement-derived fields in place
    pub fn update(&mut self, advertisement: &Advertisement) {
        if let Some(name) = &advertisement.name {
            self.name = name.clone();
        }
        if let Some(rssi) = advertisement.rssi {
            self.rssi = rssi;
        }
        self.advertised_services = advertisement.services.iter().copied().collect();
        self.advertisement = advertisement.raw.clone();
    }
}

/// Capability flags of a GATT characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// The (service, write, notify) triple used to talk to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GattEndpoint {
    pub service: Uuid,
    pub write_characteristic: Option<Uuid>,
    pub notify_characteristic: Option<Uuid>,
}

/// Events pushed by the platform. This is the only source of radio-originated data.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    AdapterStateChanged(AdapterState),
    DeviceFound(Advertisement),
    ConnectionStateChanged {
        id: String,
        connected: bool,
    },
    ValueChanged {
        id: String,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Discovery parameters handed to the platform
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Report every advertisement instead of one per device
    pub allow_duplicates: bool,
    /// Minimum spacing between reports for one device; zero reports every one
    pub interval: Duration,
    /// Restrict discovery to these services; empty means all advertisers
    pub services: Vec<Uuid>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            allow_duplicates: false,
            interval: Duration::ZERO,
            services: Vec::new(),
        }
    }
}
