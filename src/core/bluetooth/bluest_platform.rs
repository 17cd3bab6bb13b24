//! `BlePlatform` backed by the bluest cross-platform BLE central.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bluest::{Adapter, AdapterEvent, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::bluetooth::constants::PLATFORM_EVENT_CAPACITY;
use crate::core::bluetooth::error::BluetoothError;
use crate::core::bluetooth::platform::BlePlatform;
use crate::core::bluetooth::types::{
    AdapterState, Advertisement, CharacteristicProperties, GattCharacteristic, GattService,
    PlatformEvent, ScanOptions,
};

/// How long `adapter_state` waits for the radio to answer
const AVAILABILITY_PROBE: Duration = Duration::from_millis(250);
/// How long `open_adapter` waits for the radio to come up
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Polling period of the per-device link watcher
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn transport(e: bluest::Error) -> BluetoothError {
    BluetoothError::transport(e.to_string())
}

#[derive(Default)]
struct Registry {
    open: bool,
    devices: HashMap<String, Device>,
    services: HashMap<String, Vec<Service>>,
    characteristics: HashMap<(String, Uuid), Vec<(Characteristic, CharacteristicProperties)>>,
    link_watchers: HashMap<String, JoinHandle<()>>,
    notify_tasks: HashMap<(String, Uuid), JoinHandle<()>>,
    scan_task: Option<JoinHandle<()>>,
    adapter_task: Option<JoinHandle<()>>,
    mtu: HashMap<String, u16>,
}

pub struct BluestPlatform {
    adapter: Adapter,
    events: broadcast::Sender<PlatformEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl BluestPlatform {
    /// Binds to the system default adapter.
    pub async fn new() -> Result<Arc<Self>, BluetoothError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BluetoothError::Adapter("No Bluetooth adapter found".into()))?;
        let (events, _) = broadcast::channel(PLATFORM_EVENT_CAPACITY);
        Ok(Arc::new(Self {
            adapter,
            events,
            registry: Arc::new(Mutex::new(Registry::default())),
        }))
    }

    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> Result<R, BluetoothError> {
        self.registry
            .lock()
            .map(|mut registry| f(&mut registry))
            .map_err(|_| BluetoothError::transport("platform registry poisoned"))
    }

    fn device(&self, id: &str) -> Result<Device, BluetoothError> {
        self.with_registry(|r| r.devices.get(id).cloned())?
            .ok_or_else(|| BluetoothError::transport(format!("unknown device {id}")))
    }

    fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    fn is_scanning(&self) -> bool {
        self.with_registry(|r| r.scan_task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    fn spawn_adapter_events(&self) {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let registry = self.registry.clone();
        let task = tokio::spawn(async move {
            let mut stream = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Adapter events unavailable: {}", e);
                    return;
                }
            };
            while let Some(event) = stream.next().await {
                let available = match event {
                    Ok(AdapterEvent::Available) => true,
                    Ok(AdapterEvent::Unavailable) => false,
                    Err(e) => {
                        error!("Error in adapter event stream: {}", e);
                        continue;
                    }
                };
                let discovering = registry
                    .lock()
                    .map(|r| available && r.scan_task.is_some())
                    .unwrap_or(false);
                let _ = events.send(PlatformEvent::AdapterStateChanged(AdapterState {
                    available,
                    discovering,
                }));
            }
            debug!("Adapter event stream ended");
        });
        if let Ok(mut registry) = self.registry.lock() {
            if let Some(previous) = registry.adapter_task.replace(task) {
                previous.abort();
            }
        }
    }

    /// Watches one link and reports the moment it drops.
    fn spawn_link_watcher(&self, id: String, device: Device) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LINK_POLL_INTERVAL).await;
                if !device.is_connected().await {
                    info!("Link to {} dropped", id);
                    let _ = events.send(PlatformEvent::ConnectionStateChanged {
                        id,
                        connected: false,
                    });
                    break;
                }
            }
        })
    }

    async fn characteristic(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Characteristic, CharacteristicProperties), BluetoothError> {
        let key = (id.to_string(), service);
        let cached = self.with_registry(|r| r.characteristics.get(&key).cloned())?;
        if cached.is_none() {
            self.characteristics(id, service).await?;
        }
        self.with_registry(|r| {
            r.characteristics
                .get(&key)
                .and_then(|list| list.iter().find(|(c, _)| c.uuid() == characteristic).cloned())
        })?
        .ok_or_else(|| {
            BluetoothError::transport(format!("characteristic {characteristic} not found"))
        })
    }

    fn forget_device(&self, id: &str) {
        let _ = self.with_registry(|r| {
            if let Some(watcher) = r.link_watchers.remove(id) {
                watcher.abort();
            }
            r.notify_tasks.retain(|(device, _), task| {
                if device == id {
                    task.abort();
                    false
                } else {
                    true
                }
            });
            r.services.remove(id);
            r.characteristics.retain(|(device, _), _| device != id);
            r.mtu.remove(id);
        });
    }
}

/// Drops advertisers without a live link. Returns how many were dropped.
fn prune_advertisers<V>(
    devices: &mut HashMap<String, V>,
    linked: impl Fn(&str) -> bool,
) -> usize {
    let before = devices.len();
    devices.retain(|id, _| linked(id));
    before - devices.len()
}

fn map_properties(props: bluest::CharacteristicProperties) -> CharacteristicProperties {
    CharacteristicProperties {
        read: props.read,
        write: props.write,
        write_without_response: props.write_without_response,
        notify: props.notify,
        indicate: props.indicate,
    }
}

#[async_trait]
impl BlePlatform for BluestPlatform {
    async fn open_adapter(&self) -> Result<(), BluetoothError> {
        match tokio::time::timeout(OPEN_TIMEOUT, self.adapter.wait_available()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BluetoothError::Adapter(e.to_string())),
            Err(_) => {
                return Err(BluetoothError::Adapter(
                    "Bluetooth is turned off or access was denied".into(),
                ));
            }
        }
        let newly_opened = self.with_registry(|r| !std::mem::replace(&mut r.open, true))?;
        if newly_opened {
            info!("Bluetooth adapter is available.");
            self.spawn_adapter_events();
            self.emit(PlatformEvent::AdapterStateChanged(AdapterState {
                available: true,
                discovering: false,
            }));
        }
        Ok(())
    }

    async fn close_adapter(&self) -> Result<(), BluetoothError> {
        let (devices, tasks) = self.with_registry(|r| {
            r.open = false;
            let mut tasks: Vec<JoinHandle<()>> =
                r.link_watchers.drain().map(|(_, t)| t).collect();
            tasks.extend(r.notify_tasks.drain().map(|(_, t)| t));
            tasks.extend(r.scan_task.take());
            tasks.extend(r.adapter_task.take());
            r.services.clear();
            r.characteristics.clear();
            (r.devices.values().cloned().collect::<Vec<_>>(), tasks)
        })?;
        for task in tasks {
            task.abort();
        }
        for device in devices {
            if device.is_connected().await {
                if let Err(e) = self.adapter.disconnect_device(&device).await {
                    warn!("Releasing {} during close failed: {}", device.id(), e);
                }
            }
        }
        self.with_registry(|r| r.devices.clear())?;
        Ok(())
    }

    async fn adapter_state(&self) -> Result<AdapterState, BluetoothError> {
        if !self.with_registry(|r| r.open)? {
            return Ok(AdapterState::default());
        }
        let available = matches!(
            tokio::time::timeout(AVAILABILITY_PROBE, self.adapter.wait_available()).await,
            Ok(Ok(()))
        );
        Ok(AdapterState {
            available,
            discovering: available && self.is_scanning(),
        })
    }

    async fn start_discovery(&self, options: ScanOptions) -> Result<(), BluetoothError> {
        if !self.with_registry(|r| r.open)? {
            return Err(BluetoothError::Scan("adapter not open".into()));
        }
        self.stop_discovery().await?;
        let dropped = self.with_registry(|r| {
            let links = &r.link_watchers;
            prune_advertisers(&mut r.devices, |id| {
                links.get(id).is_some_and(|watcher| !watcher.is_finished())
            })
        })?;
        if dropped > 0 {
            debug!("Forgot {} advertisers from the previous scan", dropped);
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let registry = self.registry.clone();
        let (started_tx, started_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut stream = match adapter.scan(&options.services).await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let mut last_report: HashMap<String, Instant> = HashMap::new();
            let mut seen: HashSet<String> = HashSet::new();
            while let Some(found) = stream.next().await {
                let id = found.device.id().to_string();
                if !options.allow_duplicates && !seen.insert(id.clone()) {
                    continue;
                }
                if !options.interval.is_zero() {
                    let now = Instant::now();
                    if last_report
                        .get(&id)
                        .is_some_and(|at| now.duration_since(*at) < options.interval)
                    {
                        continue;
                    }
                    last_report.insert(id.clone(), now);
                }
                let name = found
                    .adv_data
                    .local_name
                    .clone()
                    .or_else(|| found.device.name().ok());
                let raw = found
                    .adv_data
                    .manufacturer_data
                    .as_ref()
                    .map(|m| {
                        let mut raw = m.company_id.to_le_bytes().to_vec();
                        raw.extend_from_slice(&m.data);
                        raw
                    })
                    .unwrap_or_default();
                if let Ok(mut registry) = registry.lock() {
                    registry.devices.insert(id.clone(), found.device.clone());
                }
                let _ = events.send(PlatformEvent::DeviceFound(Advertisement {
                    id,
                    name,
                    rssi: found.rssi,
                    services: found.adv_data.services.clone(),
                    raw,
                }));
            }
            info!("Bluetooth scan stream has ended.");
        });
        self.with_registry(|r| r.scan_task = Some(task))?;

        match started_rx.await {
            Ok(Ok(())) => {
                info!("Starting bluetooth scan");
                Ok(())
            }
            Ok(Err(message)) => Err(BluetoothError::Scan(message)),
            Err(_) => Err(BluetoothError::Scan("scan task ended before starting".into())),
        }
    }

    async fn stop_discovery(&self) -> Result<(), BluetoothError> {
        if let Some(task) = self.with_registry(|r| r.scan_task.take())? {
            task.abort();
            debug!("Bluetooth scan stopped");
        }
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), BluetoothError> {
        let device = self.device(id)?;
        if !device.is_connected().await {
            info!("Initiating connection to {}...", id);
            self.adapter.connect_device(&device).await.map_err(transport)?;
        }
        let watcher = self.spawn_link_watcher(id.to_string(), device);
        self.with_registry(|r| {
            if let Some(previous) = r.link_watchers.insert(id.to_string(), watcher) {
                previous.abort();
            }
        })?;
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), BluetoothError> {
        let device = self.device(id)?;
        self.forget_device(id);
        if device.is_connected().await {
            info!("Disconnecting from device {}", id);
            self.adapter.disconnect_device(&device).await.map_err(transport)?;
            self.emit(PlatformEvent::ConnectionStateChanged {
                id: id.to_string(),
                connected: false,
            });
        } else {
            debug!("Device {} not connected", id);
        }
        Ok(())
    }

    async fn services(&self, id: &str) -> Result<Vec<GattService>, BluetoothError> {
        let device = self.device(id)?;
        if !device.is_connected().await {
            return Err(BluetoothError::transport(format!("{id} is not connected")));
        }
        let services = device.discover_services().await.map_err(transport)?;
        let listed = services
            .iter()
            .map(|s| GattService {
                uuid: s.uuid(),
                is_primary: true,
            })
            .collect();
        self.with_registry(|r| r.services.insert(id.to_string(), services))?;
        Ok(listed)
    }

    async fn characteristics(
        &self,
        id: &str,
        service: Uuid,
    ) -> Result<Vec<GattCharacteristic>, BluetoothError> {
        // Cached handles outlive the link, so check it on every query.
        if !self.device(id)?.is_connected().await {
            return Err(BluetoothError::transport(format!("{id} is not connected")));
        }
        if self.with_registry(|r| !r.services.contains_key(id))? {
            self.services(id).await?;
        }
        let found = self
            .with_registry(|r| {
                r.services
                    .get(id)
                    .and_then(|list| list.iter().find(|s| s.uuid() == service).cloned())
            })?
            .ok_or_else(|| BluetoothError::transport(format!("service {service} not found")))?;

        let mut listed = Vec::new();
        let mut cached = Vec::new();
        for characteristic in found.discover_characteristics().await.map_err(transport)? {
            let properties = map_properties(characteristic.properties().await.map_err(transport)?);
            listed.push(GattCharacteristic {
                uuid: characteristic.uuid(),
                properties,
            });
            cached.push((characteristic, properties));
        }
        self.with_registry(|r| r.characteristics.insert((id.to_string(), service), cached))?;
        Ok(listed)
    }

    async fn set_notify(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), BluetoothError> {
        let key = (id.to_string(), characteristic);
        if let Some(previous) = self.with_registry(|r| r.notify_tasks.remove(&key))? {
            previous.abort();
        }
        if !enabled {
            return Ok(());
        }

        let (target, _) = self.characteristic(id, service, characteristic).await?;
        let events = self.events.clone();
        let source = id.to_string();
        let (started_tx, started_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut stream = match target.notify().await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e.to_string()));
                    return;
                }
            };
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => {
                        let _ = events.send(PlatformEvent::ValueChanged {
                            id: source.clone(),
                            service,
                            characteristic,
                            value,
                        });
                    }
                    Err(e) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                }
            }
            debug!("Notification stream for {} ended", source);
        });
        self.with_registry(|r| r.notify_tasks.insert(key, task))?;

        match started_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(BluetoothError::Transport(message)),
            Err(_) => Err(BluetoothError::transport("notification task ended early")),
        }
    }

    async fn write(
        &self,
        id: &str,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BluetoothError> {
        let (target, properties) = self.characteristic(id, service, characteristic).await?;
        if properties.write {
            target.write(data).await.map_err(transport)
        } else {
            target.write_without_response(data).await.map_err(transport)
        }
    }

    async fn request_mtu(&self, id: &str, mtu: u16) -> Result<(), BluetoothError> {
        // MTU exchange is driven by the OS stack; only the preference is kept.
        debug!("Preferred MTU for {} is {}", id, mtu);
        self.with_registry(|r| r.mtu.insert(id.to_string(), mtu))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.events.subscribe()
    }
}
