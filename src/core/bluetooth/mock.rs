//! Scripted in-memory platform used by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    PLATFORM_EVENT_CAPACITY, UUID_STANDARD_NOTIFY_CHAR, UUID_STANDARD_SERVICE,
    UUID_STANDARD_WRITE_CHAR,
};
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::types::{
    AdapterState, Advertisement, CharacteristicProperties, GattCharacteristic, GattService,
    PlatformEvent, ScanOptions,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Open,
    Close,
    StartDiscovery(ScanOptions),
    StopDiscovery,
    Connect(String),
    Disconnect(String),
    Services(String),
    Characteristics(String, Uuid),
    SetNotify(String, Uuid, bool),
    Write(String, Uuid, Vec<u8>),
    RequestMtu(String, u16),
}

#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    pub services: Vec<GattService>,
    pub characteristics: HashMap<Uuid, Vec<GattCharacteristic>>,
    pub connected: bool,
    /// Number of connect attempts that fail before one succeeds
    pub failing_connects: usize,
    pub hang_connect: bool,
    pub fail_notify: bool,
    pub fail_write: bool,
}

pub fn props(write: bool, notify: bool) -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        write,
        write_without_response: false,
        notify,
        indicate: false,
    }
}

fn service(n: u128) -> GattService {
    GattService {
        uuid: Uuid::from_u128(n),
        is_primary: true,
    }
}

pub fn characteristic(uuid: Uuid, properties: CharacteristicProperties) -> GattCharacteristic {
    GattCharacteristic { uuid, properties }
}

impl MockDevice {
    /// A device exposing the standard service between two generic ones.
    pub fn standard() -> Self {
        let mut device = Self {
            services: vec![
                service(0x1800),
                GattService {
                    uuid: UUID_STANDARD_SERVICE,
                    is_primary: true,
                },
                service(0x180a),
            ],
            ..Default::default()
        };
        device.characteristics.insert(
            UUID_STANDARD_SERVICE,
            vec![
                characteristic(UUID_STANDARD_NOTIFY_CHAR, props(false, true)),
                characteristic(UUID_STANDARD_WRITE_CHAR, props(true, false)),
            ],
        );
        device
    }

    /// A device without the standard service; `count` services where the third from
    /// the end carries a write characteristic followed by a notify characteristic.
    pub fn heuristic(count: usize) -> Self {
        let services: Vec<GattService> =
            (0..count).map(|i| service(0xa000 + i as u128)).collect();
        let mut device = Self {
            services: services.clone(),
            ..Default::default()
        };
        for (index, svc) in services.iter().enumerate() {
            let base = 0xb000 + (index as u128) * 0x10;
            device.characteristics.insert(
                svc.uuid,
                vec![
                    characteristic(Uuid::from_u128(base), props(true, false)),
                    characteristic(Uuid::from_u128(base + 1), props(false, true)),
                ],
            );
        }
        device
    }

    pub fn heuristic_service(&self) -> Uuid {
        self.services[self.services.len() - 3].uuid
    }
}

#[derive(Default)]
struct MockState {
    powered: bool,
    open: bool,
    discovering: bool,
    fail_open: bool,
    fail_close: bool,
    devices: HashMap<String, MockDevice>,
    calls: Vec<Call>,
}

pub struct MockPlatform {
    events: broadcast::Sender<PlatformEvent>,
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(PLATFORM_EVENT_CAPACITY);
        Arc::new(Self {
            events,
            state: Mutex::new(MockState {
                powered: true,
                ..Default::default()
            }),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_device(&self, id: &str, device: MockDevice) {
        self.with_state(|s| s.devices.insert(id.to_string(), device));
    }

    pub fn remove_device(&self, id: &str) {
        self.with_state(|s| s.devices.remove(id));
    }

    pub fn update_device(&self, id: &str, f: impl FnOnce(&mut MockDevice)) {
        self.with_state(|s| {
            if let Some(device) = s.devices.get_mut(id) {
                f(device);
            }
        });
    }

    pub fn is_device_connected(&self, id: &str) -> bool {
        self.with_state(|s| s.devices.get(id).map(|d| d.connected).unwrap_or(false))
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.with_state(|s| s.fail_open = fail);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.with_state(|s| s.fail_close = fail);
    }

    /// Simulates the radio being switched on or off outside the app.
    pub fn set_powered(&self, powered: bool) {
        let state = self.with_state(|s| {
            s.powered = powered;
            if !powered {
                s.discovering = false;
                for device in s.devices.values_mut() {
                    device.connected = false;
                }
            }
            AdapterState {
                available: s.powered && s.open,
                discovering: s.discovering,
            }
        });
        self.emit(PlatformEvent::AdapterStateChanged(state));
    }

    pub fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    pub fn advertise(&self, id: &str, name: &str, rssi: i16) {
        self.emit(PlatformEvent::DeviceFound(Advertisement {
            id: id.to_string(),
            name: Some(name.to_string()),
            rssi: Some(rssi),
            services: Vec::new(),
            raw: vec![rssi as u8],
        }));
    }

    pub fn notify(&self, id: &str, service: Uuid, characteristic: Uuid, text: &str) {
        self.emit(PlatformEvent::ValueChanged {
            id: id.to_string(),
            service,
            characteristic,
            value: text.bytes().collect(),
        });
    }

    /// Radio-layer link loss with no application acknowledgement.
    pub fn drop_link(&self, id: &str) {
        self.update_device(id, |d| d.connected = false);
        self.emit(PlatformEvent::ConnectionStateChanged {
            id: id.to_string(),
            connected: false,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn writes(&self, id: &str) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Write(target, _, data) if target == id => Some(data),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.with_state(|s| s.calls.push(call));
    }

    fn connected_device(&self, id: &str) -> Result<MockDevice, BluetoothError> {
        self.with_state(|s| match s.devices.get(id) {
            Some(device) if device.connected => Ok(device.clone()),
            Some(_) => Err(BluetoothError::transport(format!("{id} is not connected"))),
            None => Err(BluetoothError::transport(format!("unknown device {id}"))),
        })
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn open_adapter(&self) -> Result<(), BluetoothError> {
        self.record(Call::Open);
        let changed = self.with_state(|s| {
            if s.fail_open || !s.powered {
                return Err(BluetoothError::Adapter("bluetooth is turned off".into()));
            }
            let changed = !s.open;
            s.open = true;
            Ok(changed)
        })?;
        if changed {
            self.emit(PlatformEvent::AdapterStateChanged(AdapterState {
                available: true,
                discovering: false,
            }));
        }
        Ok(())
    }

    async fn close_adapter(&self) -> Result<(), BluetoothError> {
        self.record(Call::Close);
        self.with_state(|s| {
            if s.fail_close {
                return Err(BluetoothError::Adapter("close rejected".into()));
            }
            s.open = false;
            s.discovering = false;
            Ok(())
        })
    }

    async fn adapter_state(&self) -> Result<AdapterState, BluetoothError> {
        Ok(self.with_state(|s| AdapterState {
            available: s.powered && s.open,
            discovering: s.discovering,
        }))
    }

    async fn start_discovery(&self, options: ScanOptions) -> Result<(), BluetoothError> {
        self.record(Call::StartDiscovery(options));
        self.with_state(|s| {
            if !(s.powered && s.open) {
                return Err(BluetoothError::Scan("adapter not open".into()));
            }
            s.discovering = true;
            Ok(())
        })
    }

    async fn stop_discovery(&self) -> Result<(), BluetoothError> {
        self.record(Call::StopDiscovery);
        self.with_state(|s| s.discovering = false);
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), BluetoothError> {
        self.record(Call::Connect(id.to_string()));
        let hang = self.with_state(|s| match s.devices.get_mut(id) {
            None => Err(BluetoothError::transport(format!("unknown device {id}"))),
            Some(device) if device.hang_connect => Ok(true),
            Some(device) if device.failing_connects > 0 => {
                device.failing_connects -= 1;
                Err(BluetoothError::transport("connection refused"))
            }
            Some(device) => {
                device.connected = true;
                Ok(false)
            }
        })?;
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), BluetoothError> {
        self.record(Call::Disconnect(id.to_string()));
        let was_connected = self.with_state(|s| match s.devices.get_mut(id) {
            Some(device) => {
                let was = device.connected;
                device.connected = false;
                Ok(was)
            }
            None => Err(BluetoothError::transport(format!("unknown device {id}"))),
        })?;
        if was_connected {
            self.emit(PlatformEvent::ConnectionStateChanged {
                id: id.to_string(),
                connected: false,
            });
        }
        Ok(())
    }

    async fn services(&self, id: &str) -> Result<Vec<GattService>, BluetoothError> {
        self.record(Call::Services(id.to_string()));
        Ok(self.connected_device(id)?.services)
    }

    async fn characteristics(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>, BluetoothError> {
        self.record(Call::Characteristics(id.to_string(), service));
        let device = self.connected_device(id)?;
        Ok(device.characteristics.get(&service).cloned().unwrap_or_default())
    }

    async fn set_notify(
        &self,
        id: &str,
        _service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), BluetoothError> {
        self.record(Call::SetNotify(id.to_string(), characteristic, enabled));
        let device = self.connected_device(id)?;
        if device.fail_notify {
            return Err(BluetoothError::transport("CCCD write rejected"));
        }
        Ok(())
    }

    async fn write(
        &self,
        id: &str,
        _service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BluetoothError> {
        self.record(Call::Write(id.to_string(), characteristic, data.to_vec()));
        let device = self.connected_device(id)?;
        if device.fail_write {
            return Err(BluetoothError::transport("write rejected"));
        }
        Ok(())
    }

    async fn request_mtu(&self, id: &str, mtu: u16) -> Result<(), BluetoothError> {
        self.record(Call::RequestMtu(id.to_string(), mtu));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }
}
